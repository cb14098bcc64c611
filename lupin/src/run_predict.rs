use crate::model::Model;

use clap::Parser;
use log::info;
use matrix_util::common_io::{read_lines_of_types, write_lines};

#[derive(Parser, Debug, Clone)]
pub struct PredictArgs {
    /// checkpoint prefix of one retained sample,
    /// e.g. `out/chk-sample40`
    #[arg(long, short = 'p', required = true)]
    prefix: Box<str>,

    /// coordinates to score, one `row col` pair per line
    #[arg(long, short = 'c', required = true)]
    coords: Box<str>,

    /// global mean offset added back onto every prediction (the
    /// training data mean when the model was trained on centered data)
    #[arg(long, default_value_t = 0.0)]
    mean: f64,

    /// output file
    #[arg(long, short = 'o', required = true)]
    out: Box<str>,
}

pub fn run_predict(args: PredictArgs) -> anyhow::Result<()> {
    env_logger::init();

    let model = Model::restore(&args.prefix)?;
    info!(
        "restored model: num_latent {}, dims {:?}",
        model.num_latent(),
        model.dims()
    );

    let parsed = read_lines_of_types::<f64>(&args.coords, &[' ', '\t'][..], -1)?.lines;

    let mut lines: Vec<Box<str>> = Vec::with_capacity(parsed.len() + 1);
    lines.push("#row\tcol\tpredicted".into());
    for (ln, fields) in parsed.iter().enumerate() {
        if fields.len() < 2 {
            anyhow::bail!("{}:{}: expected `row col`", args.coords, ln + 1);
        }
        let row = fields[0] as usize;
        let col = fields[1] as usize;
        if row >= model.dim(0) || col >= model.dim(1) {
            anyhow::bail!("coordinate ({}, {}) out of range", row, col);
        }
        let pred = model.predict(&[row, col]) + args.mean;
        lines.push(format!("{}\t{}\t{}", row, col, pred).into_boxed_str());
    }

    write_lines(&lines, &args.out)?;
    Ok(())
}
