use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fastpath_bench::datatype::Precision;
use fastpath_bench::device::Device;
use fastpath_bench::driver::{run_benchmark, BenchmarkConfig};

#[derive(Parser)]
#[command(name = "fastpath-bench")]
#[command(version)]
#[command(about = "Compare a classifier's encoder against its fast-path conversion", long_about = None)]
struct Cli {
    /// Number of timed batches
    #[arg(long)]
    num_batches: Option<usize>,

    /// Sequences per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Tokens per sequence
    #[arg(long)]
    seq_len: Option<usize>,

    /// Model identifier
    #[arg(long)]
    model: Option<String>,

    /// Device to run on (cpu, metal)
    #[arg(long)]
    device: Option<Device>,

    /// Precision the model is cast to (f32, f16, bf16)
    #[arg(long)]
    precision: Option<Precision>,

    /// Seed for the synthetic inputs
    #[arg(long)]
    seed: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn")]
    log_level: String,
}

impl Cli {
    fn config(&self) -> BenchmarkConfig {
        let mut config = BenchmarkConfig::default();
        if let Some(n) = self.num_batches {
            config = config.with_num_batches(n);
        }
        if let Some(n) = self.batch_size {
            config = config.with_batch_size(n);
        }
        if let Some(n) = self.seq_len {
            config = config.with_seq_len(n);
        }
        if let Some(model) = &self.model {
            config = config.with_model_id(model.as_str());
        }
        if let Some(device) = self.device {
            config = config.with_device(device);
        }
        if let Some(precision) = self.precision {
            config = config.with_precision(precision);
        }
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        config
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(tracing_subscriber::EnvFilter::new(&cli.log_level))
        .init();

    let config = cli.config();
    let report = run_benchmark(&config).with_context(|| {
        format!(
            "benchmark of '{}' on {} failed",
            config.model_id, config.device
        )
    })?;
    println!("{report}");
    Ok(())
}
