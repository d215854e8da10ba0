// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// This is the entry point for all user interaction.
// It uses the `clap` crate to parse command line arguments.
// All business logic is delegated to Layer 2 (application).
//
// Four commands are supported:
//   1. `prepare`  — canonicalize raw EDF recordings
//   2. `train`    — train or resume an experiment
//   3. `test`     — evaluate a checkpoint on its test fold
//   4. `finetune` — continue a checkpoint on new datasets
//
// Reference: Rust Book §7 (Modules), §12 (CLI programs)

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, ExperimentArgs, FinetuneArgs, PrepareArgs};

use crate::ml::metrics::EvaluationMetrics;

#[derive(Parser, Debug)]
#[command(
    name = "sleep-pipeline",
    version,
    about = "Canonicalize PSG recordings, then train, test and finetune sleep-staging models."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Route the subcommand to its use case. Printing happens here only.
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Prepare(args)  => run_prepare(args),
            Commands::Train(args)    => run_train(args),
            Commands::Test(args)     => run_test(args),
            Commands::Finetune(args) => run_finetune(args),
        }
    }
}

fn run_prepare(args: PrepareArgs) -> Result<()> {
    use crate::application::prepare_use_case;

    let config = args.experiment.resolve()?;
    let report = prepare_use_case::run_prepare(&config, &args.raw_dir)?;
    println!(
        "Prepared {} subjects ({} written), {} windows in '{}'",
        report.subjects,
        report.written,
        report.windows,
        config.store_path.display()
    );
    Ok(())
}

fn run_train(args: ExperimentArgs) -> Result<()> {
    use crate::application::train_use_case;

    let config = args.resolve()?;
    let report = train_use_case::run_train(&config)?;
    println!("Training {} after {} epoch(s).", report.phase, report.epochs);
    if let Some(value) = report.best_value {
        println!("Best epoch {} ({} = {:.4})", report.best_epoch, config.monitor, value);
    }
    if let Some(epoch) = report.early_stopped_at {
        println!("Early stopped at epoch {epoch}.");
    }
    if let Some(metrics) = &report.test {
        print_metrics("Test", metrics);
    }
    Ok(())
}

fn run_test(args: ExperimentArgs) -> Result<()> {
    use crate::application::train_use_case;

    let config  = args.resolve()?;
    let metrics = train_use_case::run_test(&config)?;
    print_metrics("Test", &metrics);
    Ok(())
}

fn run_finetune(args: FinetuneArgs) -> Result<()> {
    use crate::application::train_use_case;

    let config  = args.experiment.resolve()?;
    let metrics = train_use_case::run_finetune(&config, &args.from)?;
    println!(
        "Finetuned '{}' into '{}'.",
        args.from.display(),
        config.checkpoint_path.display()
    );
    print_metrics("Evaluation", &metrics);
    Ok(())
}

fn print_metrics(title: &str, m: &EvaluationMetrics) {
    println!("\n{title}: {m}");
    println!("Confusion (rows = truth, W N1 N2 N3 REM):");
    for row in &m.confusion {
        let cells: Vec<String> = row.iter().map(|c| format!("{c:>6}")).collect();
        println!("  {}", cells.join(""));
    }
}
