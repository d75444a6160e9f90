//! flexalloc I/O bench
//!
//! Writes a random pattern through the sequential and striped submission
//! paths of a file-backed device, reads it back and compares CRC32C
//! checksums.
//!
//! ```text
//! flexalloc-io-bench --device /tmp/fla.img --size 1073741824 --mode all
//! flexalloc-io-bench --config bench.toml --mode stripe --width 8 --chunk 131072 --json
//! ```

mod bench;

use anyhow::{Context, Result, bail};
use bench::{Bench, Phase, PhaseResult};
use clap::{Parser, ValueEnum};
use flexalloc_common::Config;
use flexalloc_xnvme::{FileDevice, NvmeDevice, sanity_check, zone};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "flexalloc-io-bench")]
#[command(about = "Exercise flexalloc's sequential and striped I/O paths")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "flexalloc.toml")]
    config: PathBuf,

    /// Backing file or block device
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Device size in bytes (regular files only)
    #[arg(long)]
    size: Option<u64>,

    /// Phases to run
    #[arg(short, long, value_enum, default_value_t = Mode::All)]
    mode: Mode,

    /// Stripe width
    #[arg(long)]
    width: Option<u32>,

    /// Stripe chunk size in bytes
    #[arg(long)]
    chunk: Option<u64>,

    /// Bytes transferred per phase (default: one full stripe)
    #[arg(long)]
    xfer: Option<u64>,

    /// Open the device with direct I/O
    #[arg(long)]
    direct_io: bool,

    /// Log level
    #[arg(long, env = "FLEXALLOC_LOG")]
    log_level: Option<String>,

    /// Print a JSON summary and log as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Seq,
    Stripe,
    Zero,
    All,
}

impl Mode {
    const fn phases(self) -> &'static [Phase] {
        match self {
            Self::Seq => &[Phase::Sequential],
            Self::Stripe => &[Phase::Striped],
            Self::Zero => &[Phase::Zeroes],
            Self::All => &[Phase::Sequential, Phase::Striped, Phase::Zeroes],
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = if args.config.exists() {
        let config_str = std::fs::read_to_string(&args.config)
            .with_context(|| format!("failed to read {}", args.config.display()))?;
        toml::from_str(&config_str)
            .with_context(|| format!("failed to parse {}", args.config.display()))?
    } else {
        Config::default()
    };

    // CLI takes precedence over the config file
    if let Some(device) = &args.device {
        config.device.path.clone_from(device);
    }
    if let Some(size) = args.size {
        config.device.size = size;
    }
    if args.direct_io {
        config.device.direct_io = true;
    }
    if let Some(width) = args.width {
        config.stripe.width = width;
    }
    if let Some(chunk) = args.chunk {
        config.stripe.chunk_nbytes = chunk;
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    if args.json {
        config.logging.json = true;
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config);

    info!("Starting flexalloc I/O bench");
    info!("Config file: {}", args.config.display());
    info!(
        "Device: {} ({} bytes, {} B blocks, {} B max transfer)",
        config.device.path.display(),
        config.device.size,
        config.device.lba_nbytes,
        config.device.mdts_nbytes
    );
    info!(
        "Stripe: width {}, chunk {} B, {} blocks per member",
        config.stripe.width, config.stripe.chunk_nbytes, config.stripe.obj_nlbs
    );

    let dev = FileDevice::create(&config.device)?;
    sanity_check(dev.geometry(), None)?;
    zone::prepare_format(&dev)?;

    let stripe_nbytes = u64::from(config.stripe.width)
        * config.stripe.obj_nlbs
        * u64::from(config.device.lba_nbytes);
    let xfer_nbytes = args.xfer.unwrap_or(stripe_nbytes);
    let bench = Bench::new(&dev, &config.stripe, xfer_nbytes);

    let phases = args.mode.phases();
    let mut results: Vec<PhaseResult> = Vec::with_capacity(phases.len());
    for &phase in phases {
        match bench.run(phase) {
            Ok(result) => {
                result.log();
                results.push(result);
            }
            Err(e) => {
                error!("{} phase failed: {}", phase, e);
                return Err(e.into());
            }
        }
    }
    dev.sync()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    }

    let failed: Vec<&str> = results
        .iter()
        .filter(|r| !r.verified)
        .map(|r| r.phase)
        .collect();
    if !failed.is_empty() {
        bail!("checksum mismatch in phase(s): {}", failed.join(", "));
    }
    info!("All phases verified");
    Ok(())
}
