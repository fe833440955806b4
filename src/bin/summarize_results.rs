use std::io::{self, BufWriter};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fastpath_bench::summarize::summarize_results;

#[derive(Parser)]
#[command(name = "summarize-results")]
#[command(version)]
#[command(about = "Regroup a round-robin results log so repeats of a run are adjacent", long_about = None)]
struct Cli {
    /// Results log to regroup
    filename: PathBuf,

    /// Number of interleaved repeats in the log
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    n_repeat: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .with(tracing_subscriber::EnvFilter::new(&cli.log_level))
        .init();

    let n_repeat = usize::try_from(cli.n_repeat).context("n_repeat does not fit in usize")?;
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    summarize_results(&cli.filename, n_repeat, &mut out)
        .with_context(|| format!("could not summarize {}", cli.filename.display()))?;
    Ok(())
}
