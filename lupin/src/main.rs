use clap::{Parser, Subcommand};

use lupin::run_predict::*;
use lupin::run_train::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LUPIN",
    long_about = "Bayesian matrix factorization with side information by Gibbs sampling.\n\
		  Train a low-rank model on a partially observed matrix, optionally\n\
		  informed by per-entity features, and score held-out entries."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train a factorization model by Gibbs sampling
    Train(TrainArgs),

    /// Score coordinates with a checkpointed model
    Predict(PredictArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.commands {
        Commands::Train(args) => {
            run_train(args)?;
        }
        Commands::Predict(args) => {
            run_predict(args)?;
        }
    }

    Ok(())
}
