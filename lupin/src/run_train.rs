use crate::common::*;
use crate::data::MatrixData;
use crate::model::{Model, ModelInit};
use crate::noise::NoiseConfig;
use crate::priors::{LatentPrior, LinkConfig, LinkOnePrior, LinkPrior, NormalPrior,
                    SpikeAndSlabPrior};
use crate::session::{Session, SessionConfig};
use crate::side_info::FeatureMatrix;

use clap::Parser;
use log::info;
use matrix_util::common_io::{read_lines_of_types, write_lines};
use matrix_util::traits::IoOps;
use rand::rngs::SmallRng;
use rand::SeedableRng;

#[derive(Parser, Debug, Clone)]
pub struct TrainArgs {
    /// training matrix: dense tsv or sparse triplets (`row col value`),
    /// either gzipped or not
    #[arg(long, short = 'd', required = true)]
    train: Box<str>,

    /// treat the training file as a dense matrix
    #[arg(long, default_value_t = false)]
    dense: bool,

    /// sparse training data: unobserved entries are observed zeros
    /// rather than missing
    #[arg(long, default_value_t = false)]
    zero_unseen: bool,

    /// held-out triplets (`row col value`) for evaluation
    #[arg(long, short = 't')]
    test: Option<Box<str>>,

    /// side-information features for the row mode (dense tsv, or
    /// triplets with --sparse-features)
    #[arg(long)]
    row_features: Option<Box<str>>,

    /// side-information features for the column mode
    #[arg(long)]
    col_features: Option<Box<str>>,

    /// feature files hold sparse triplets
    #[arg(long, default_value_t = false)]
    sparse_features: bool,

    /// number of latent dimensions
    #[arg(long, short = 'k', default_value_t = 16)]
    num_latent: usize,

    /// burn-in iterations (discarded from the running average)
    #[arg(long, default_value_t = 200)]
    burnin: usize,

    /// posterior samples after burn-in
    #[arg(long, default_value_t = 800)]
    nsamples: usize,

    /// prior for the row mode: normal, link, link-one, spike-slab
    #[arg(long, default_value = "normal")]
    row_prior: Box<str>,

    /// prior for the column mode
    #[arg(long, default_value = "normal")]
    col_prior: Box<str>,

    /// noise model: fixed, adaptive, probit, noiseless
    #[arg(long, default_value = "fixed")]
    noise: Box<str>,

    /// fixed noise precision
    #[arg(long, default_value_t = 5.0)]
    precision: f64,

    /// initial signal-to-noise ratio of the adaptive noise
    #[arg(long, default_value_t = 1.0)]
    sn_init: f64,

    /// signal-to-noise ceiling of the adaptive noise
    #[arg(long, default_value_t = 10.0)]
    sn_max: f64,

    /// binary decision threshold; enables AUC (and probit noise)
    #[arg(long)]
    threshold: Option<f64>,

    /// solve the link regression by block conjugate gradient
    #[arg(long, default_value_t = false)]
    cg: bool,

    /// residual tolerance of the iterative solver
    #[arg(long, default_value_t = 1e-6)]
    cg_tol: f64,

    /// initial link regularization strength
    #[arg(long, default_value_t = 5.0)]
    lambda_beta: f64,

    /// checkpoint file prefix
    #[arg(long)]
    save_prefix: Option<Box<str>>,

    /// write every n-th retained sample (0 = never)
    #[arg(long, default_value_t = 10)]
    save_freq: usize,

    /// worker threads of the sampling pool (default: all cores)
    #[arg(long)]
    num_threads: Option<usize>,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// output file for the held-out predictions
    #[arg(long, short = 'o', required = true)]
    out: Box<str>,
}

/// Parse whitespace/tab-delimited `(row, col, value)` lines; the value
/// column is optional and defaults to one.
pub fn read_triplets(file: &str) -> anyhow::Result<Vec<(usize, usize, f64)>> {
    let parsed = read_lines_of_types::<f64>(file, &[' ', '\t'][..], -1)?.lines;

    let mut triplets = Vec::with_capacity(parsed.len());
    for (ln, fields) in parsed.iter().enumerate() {
        if fields.len() < 2 {
            anyhow::bail!("{}:{}: expected `row col [value]`", file, ln + 1);
        }
        let row = fields[0] as usize;
        let col = fields[1] as usize;
        let val = if fields.len() > 2 { fields[2] } else { 1.0 };
        triplets.push((row, col, val));
    }
    Ok(triplets)
}

fn triplet_dims(triplets: &[(usize, usize, f64)]) -> (usize, usize) {
    let nrow = triplets.iter().map(|&(rr, _, _)| rr + 1).max().unwrap_or(0);
    let ncol = triplets.iter().map(|&(_, cc, _)| cc + 1).max().unwrap_or(0);
    (nrow, ncol)
}

fn read_features(
    file: &str,
    sparse: bool,
    num_entities: usize,
) -> anyhow::Result<FeatureMatrix> {
    if sparse {
        let triplets = read_triplets(file)?;
        let (nrow, ncol) = triplet_dims(&triplets);
        FeatureMatrix::from_triplets(nrow.max(num_entities), ncol, triplets)
    } else {
        FeatureMatrix::from_dense(Mat::from_tsv(file, None)?)
    }
}

fn build_prior(
    name: &str,
    mode: usize,
    num_latent: usize,
    data: &MatrixData,
    features: Option<&str>,
    args: &TrainArgs,
) -> anyhow::Result<Box<dyn LatentPrior>> {
    let dim = data.dim(mode);
    let seed = args.seed.wrapping_add(mode as u64 + 1);

    let feat = || -> anyhow::Result<FeatureMatrix> {
        let file = features.ok_or_else(|| {
            anyhow::anyhow!("prior `{}` on mode {} needs side information", name, mode)
        })?;
        read_features(file, args.sparse_features, dim)
    };

    match name {
        "normal" => Ok(Box::new(NormalPrior::new(mode, num_latent, seed))),
        "link" => {
            let config = LinkConfig {
                use_direct: !args.cg,
                tol: args.cg_tol,
                lambda_beta_init: args.lambda_beta,
                num_workers: None,
            };
            Ok(Box::new(LinkPrior::new(
                mode, num_latent, dim, feat()?, config, seed,
            )?))
        }
        "link-one" => Ok(Box::new(LinkOnePrior::new(
            mode,
            num_latent,
            dim,
            feat()?,
            args.lambda_beta,
            seed,
        )?)),
        "spike-slab" => Ok(Box::new(SpikeAndSlabPrior::new(
            mode,
            num_latent,
            data.nview(mode),
            dim,
            seed,
        ))),
        _ => Err(anyhow::anyhow!("unknown prior: {}", name)),
    }
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    env_logger::init();

    let num_threads = args.num_threads.unwrap_or_else(num_cpus::get);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;
    info!("sampling pool: {} threads", num_threads);

    let noise = NoiseConfig::from_name(
        &args.noise,
        args.precision,
        args.sn_init,
        args.sn_max,
        args.threshold.unwrap_or(0.0),
    )?;

    let data = if args.dense {
        MatrixData::from_dense(Mat::from_tsv(&args.train, None)?, noise)?
    } else {
        let triplets = read_triplets(&args.train)?;
        let (nrow, ncol) = triplet_dims(&triplets);
        if matches!(noise, NoiseConfig::Probit { .. }) {
            let pairs = triplets.into_iter().map(|(rr, cc, _)| (rr, cc)).collect();
            MatrixData::from_binary_pairs(nrow, ncol, pairs, noise)?
        } else {
            MatrixData::from_triplets(nrow, ncol, triplets, !args.zero_unseen, noise)?
        }
    };
    info!(
        "training data: {} x {}, {} stored entries, mean {:.4}",
        data.dim(0),
        data.dim(1),
        data.nnz(),
        data.mean_value()
    );

    let test = match &args.test {
        Some(file) => read_triplets(file)?,
        None => vec![],
    };

    let mut rng = SmallRng::seed_from_u64(args.seed);
    let dims = [data.dim(0), data.dim(1)];
    let model = Model::init(args.num_latent, &dims, ModelInit::Random, &mut rng)?;

    let priors: Vec<Box<dyn LatentPrior>> = vec![
        build_prior(
            &args.row_prior,
            0,
            args.num_latent,
            &data,
            args.row_features.as_deref(),
            &args,
        )?,
        build_prior(
            &args.col_prior,
            1,
            args.num_latent,
            &data,
            args.col_features.as_deref(),
            &args,
        )?,
    ];

    let config = SessionConfig {
        burnin: args.burnin,
        nsamples: args.nsamples,
        save_prefix: args.save_prefix.clone(),
        save_freq: args.save_freq,
        threshold: args.threshold,
        seed: args.seed,
        show_progress: true,
    };

    let mut session = Session::new(model, data, priors, test, config)?;
    session.run()?;

    info!(
        "done: RMSE {:.5} (avg over {} samples), AUC {:.5}, train RMSE {:.5}",
        session.result.rmse_avg,
        session.result.sample_iter,
        session.result.auc,
        session.data.train_rmse(&session.model.full())
    );
    info!("{}", session.status());

    let mut lines: Vec<Box<str>> = Vec::with_capacity(session.result.len() + 1);
    lines.push("#row\tcol\tobserved\tpredicted\tlast_sample".into());
    for item in &session.result.items {
        lines.push(
            format!(
                "{}\t{}\t{}\t{}\t{}",
                item.row, item.col, item.val, item.pred_avg, item.pred
            )
            .into_boxed_str(),
        );
    }
    write_lines(&lines, &args.out)?;

    Ok(())
}
