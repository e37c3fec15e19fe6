use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Once};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use common::{Bio, BioVec, DeviceRegistry, Sector, SECTOR_SIZE};
use crypt_target::{CryptTarget, StatusType, TargetConfig};
use sim_blkdev::{start_registered, CompletionMode, SimDisk, SimDiskConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEVICE_NAME: &str = "disk0";

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let format = std::env::var("CRYPT_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

        if format.eq_ignore_ascii_case("json") {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_writer(io::stderr)
                .json()
                .flatten_event(true)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .with_writer(io::stderr)
                .compact()
                .init();
        }
    });
}

#[derive(Parser)]
#[command(name = "cryptctl")]
#[command(about = "Encrypted block device control utility", long_about = None)]
struct Cli {
    #[command(flatten)]
    target: TargetArgs,
    #[command(subcommand)]
    command: Commands,
}

/// Where the ciphertext lives and how it is mapped.
#[derive(Clone, Debug, Args)]
struct TargetArgs {
    /// Backing image file; created and grown as needed
    #[arg(long, global = true, default_value = "crypt.img")]
    disk: PathBuf,
    /// Image size in sectors
    #[arg(long, global = true, default_value_t = 2048)]
    capacity: u64,
    /// Cipher spec, e.g. aes-cbc-essiv:sha256
    #[arg(long, global = true, default_value = "aes-cbc-essiv:sha256")]
    cipher: String,
    /// Hex key, or `-` for none
    #[arg(long, global = true, default_value = "-")]
    key: String,
    #[arg(long, global = true, default_value_t = 0)]
    iv_offset: u64,
    /// First image sector used by the mapping
    #[arg(long, global = true, default_value_t = 0)]
    start: Sector,
    /// JSON file with target tuning (workers, pool sizes, timeouts)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Complete disk I/O on a separate thread
    #[arg(long, global = true)]
    threaded: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a local file onto the device
    Write {
        /// Logical sector to start at
        #[arg(short, long)]
        sector: Sector,
        /// Source file path; zero padded to a whole sector
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Decrypt sectors and stream them to stdout
    Read {
        #[arg(short, long)]
        sector: Sector,
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u64,
    },
    /// Print the reconstructed table line
    Status,
}

fn load_config(path: Option<&PathBuf>) -> Result<TargetConfig> {
    let config = match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            TargetConfig::from_json(&text)?
        }
        None => TargetConfig::default(),
    };
    Ok(config.with_env_overrides()?)
}

fn open_target(args: &TargetArgs) -> Result<(Arc<SimDisk>, CryptTarget)> {
    let devices = DeviceRegistry::new();
    let disk = start_registered(
        &devices,
        SimDiskConfig {
            name: DEVICE_NAME.to_string(),
            capacity_sectors: args.capacity,
            backing_path: args.disk.to_string_lossy().to_string(),
            completion: if args.threaded {
                CompletionMode::Threaded
            } else {
                CompletionMode::Inline
            },
            simulated_latency_us: 0,
        },
    )?;

    let config = load_config(args.config.as_ref())?;
    let iv_offset = args.iv_offset.to_string();
    let start = args.start.to_string();
    let table = [
        args.cipher.as_str(),
        args.key.as_str(),
        iv_offset.as_str(),
        DEVICE_NAME,
        start.as_str(),
    ];
    let target = CryptTarget::new(&table, &devices, config).context("failed to build crypt target")?;
    Ok((disk, target))
}

fn write_sectors(target: &CryptTarget, sector: Sector, mut data: Vec<u8>) -> Result<usize> {
    if data.is_empty() {
        bail!("nothing to write");
    }
    data.resize(data.len().next_multiple_of(SECTOR_SIZE), 0);
    let len = data.len();

    let (_, status) = target.map_and_wait(Bio::write(sector, vec![BioVec::from_vec(data)?]));
    status?;
    Ok(len)
}

fn read_sectors(target: &CryptTarget, sector: Sector, count: u64) -> Result<Vec<u8>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let buf = BioVec::zeroed(common::sectors_to_bytes(count))?;
    let (bio, status) = target.map_and_wait(Bio::read(sector, vec![buf]));
    status.with_context(|| format!("read of {count} sectors at {sector} failed"))?;
    Ok(bio.copy_out())
}

fn run(cli: Cli) -> Result<()> {
    let (disk, target) = open_target(&cli.target)?;

    match cli.command {
        Commands::Write { sector, file } => {
            let data = fs::read(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let written = write_sectors(&target, sector, data)?;
            disk.flush()?;
            println!(
                "Wrote {} bytes ({} sectors) at sector {} from {}",
                written,
                written / SECTOR_SIZE,
                sector,
                file.display()
            );
        }
        Commands::Read { sector, count } => {
            let data = read_sectors(&target, sector, count)?;
            io::stdout().write_all(&data)?;
        }
        Commands::Status => {
            println!("{}", target.status(StatusType::Table));
            println!("Sectors: {}", target.len_sectors());
            println!("Workers: {}", target.config().workers);
        }
    }

    target.shutdown();
    info!(device = DEVICE_NAME, "done");
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    run(Cli::parse())
}
