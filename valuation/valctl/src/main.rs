use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use shared_logging::LogLevel;
use valuation_core::{
    backfill_ground_truth, compare_ledger, evaluate_dataset, BackfillOptions, ComparisonOutcome,
    MetricsSnapshot, PredictionLedger, PredictionLedgerEntry, Settings, ValuationService,
    ValuationTelemetry,
};

#[derive(Parser, Debug)]
#[command(
    name = "valctl",
    version,
    about = "Housing valuation operator tooling"
)]
struct Cli {
    /// TOML settings file; falls back to $VALUATION_CONFIG, then defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compares development metrics with production metrics from the ledger.
    Compare {
        /// Development metrics file (defaults to `model_dir/metrics.json`).
        #[arg(long)]
        dev: Option<PathBuf>,
        /// Prediction ledger (defaults to the configured ledger).
        #[arg(long)]
        ledger: Option<PathBuf>,
        /// Prints the structured report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Fills `price_gt` with noise-perturbed predictions for pipeline testing.
    ///
    /// The ledger is read, updated and rewritten in one pass. Predictions the
    /// API appends while the rewrite runs are lost, so stop the API server (or
    /// drain its traffic) before backfilling a live ledger.
    Backfill {
        /// Relative noise amplitude (finite, e.g. 0.2 for ±20 %).
        #[arg(long, default_value_t = 0.2, value_parser = parse_noise)]
        noise: f64,
        /// RNG seed.
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long)]
        ledger: Option<PathBuf>,
    },
    /// Scores a labelled CSV through the serving pipeline.
    Evaluate {
        /// Labelled dataset.
        #[arg(long)]
        data: PathBuf,
        /// Target column.
        #[arg(long, default_value = "price")]
        target: String,
        /// Writes the metrics as JSON to this path.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Shows the most recent ledger entries.
    Tail {
        /// Number of entries to display.
        #[arg(long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        ledger: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("resolving settings")?;
    let telemetry = ValuationTelemetry::from_settings("valctl", &settings)?;
    let ledger_at = |path: Option<PathBuf>| {
        PredictionLedger::new(path.unwrap_or_else(|| settings.ledger_path()))
    };

    match cli.command {
        Commands::Compare { dev, ledger, json } => {
            let dev = dev.unwrap_or_else(|| settings.dev_metrics_path());
            handle_compare(&dev, &ledger_at(ledger), json)
        }
        Commands::Backfill { noise, seed, ledger } => handle_backfill(
            &ledger_at(ledger),
            BackfillOptions {
                noise_amplitude: noise,
                seed,
            },
            &telemetry,
        ),
        Commands::Evaluate { data, target, out } => {
            let service = ValuationService::from_settings(&settings, telemetry)?;
            let snapshot = evaluate_dataset(&service, &data, &target)
                .with_context(|| format!("evaluating {}", data.display()))?;
            let rendered = serde_json::to_string_pretty(&snapshot)?;
            if let Some(out) = out {
                fs::write(&out, &rendered)
                    .with_context(|| format!("writing {}", out.display()))?;
            }
            println!("{rendered}");
            Ok(())
        }
        Commands::Tail { limit, ledger } => {
            for entry in ledger_at(ledger).tail(limit)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
            Ok(())
        }
    }
}

fn handle_compare(dev: &Path, ledger: &PredictionLedger, as_json: bool) -> Result<()> {
    let development = MetricsSnapshot::load(dev)
        .with_context(|| format!("loading development metrics {}", dev.display()))?;
    let outcome = compare_ledger(&development, ledger)?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }
    println!("Development metrics from: {}", dev.display());
    println!("  {}", serde_json::to_string_pretty(&development)?);
    match outcome {
        ComparisonOutcome::Unavailable { reason } => {
            println!("Could not calculate production metrics: {reason}");
        }
        ComparisonOutcome::Report(report) => {
            println!("\nProduction metrics from: {}", ledger.path().display());
            println!("  {}", serde_json::to_string_pretty(&report.production)?);
            println!();
            print!("{}", report.render());
        }
    }
    Ok(())
}

fn parse_noise(raw: &str) -> Result<f64, String> {
    let noise: f64 = raw.parse().map_err(|err| format!("{err}"))?;
    if noise.is_finite() {
        Ok(noise)
    } else {
        Err(format!("noise amplitude must be a finite number, got {raw}"))
    }
}

fn handle_backfill(
    ledger: &PredictionLedger,
    options: BackfillOptions,
    telemetry: &ValuationTelemetry,
) -> Result<()> {
    if !ledger.exists() {
        bail!("predictions file not found: {}", ledger.path().display());
    }
    let mut entries = ledger.load()?;
    println!(
        "Loaded {} predictions from {}",
        entries.len(),
        ledger.path().display()
    );
    let updated = backfill_ground_truth(&mut entries, options)?;
    ledger.rewrite(&entries)?;
    telemetry.emit(
        LogLevel::Info,
        "ledger.backfilled",
        json!({
            "updated": updated,
            "seed": options.seed,
            "noise": options.noise_amplitude,
        }),
    );

    println!("Updated {updated} predictions with ground truth prices");
    println!("Noise amplitude: ±{:.1}%", options.noise_amplitude * 100.0);
    println!("Random seed: {}", options.seed);
    if updated > 0 {
        println!("\nSample updated records:");
        for (idx, entry) in entries.iter().take(3).enumerate() {
            println!("  Record {}: {}", idx + 1, describe_backfill(entry));
        }
    }
    Ok(())
}

fn describe_backfill(entry: &PredictionLedgerEntry) -> String {
    let prediction = entry.price_prediction;
    let truth = entry.price_gt.unwrap_or(prediction);
    let mut line = format!("Pred=${}, GT=${}", usd(prediction), usd(truth));
    if prediction != 0.0 {
        let change = (truth - prediction) / prediction * 100.0;
        line.push_str(&format!(" ({change:+.1}%)"));
    }
    line
}

/// Whole dollars with thousands separators.
fn usd(amount: f64) -> String {
    let rounded = format!("{:.0}", amount.abs());
    let mut grouped = String::with_capacity(rounded.len() + rounded.len() / 3);
    for (idx, digit) in rounded.chars().enumerate() {
        if idx > 0 && (rounded.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    if amount < 0.0 && rounded != "0" {
        grouped.insert(0, '-');
    }
    grouped
}
