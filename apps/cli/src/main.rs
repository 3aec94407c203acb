use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fota_core::boot::StaticBootLayout;
use fota_core::flash::FileFlash;
use fota_core::image::{ImageBuilder, TargetInfo};
use fota_core::session::{OtaConfig, OtaProgress, UpdateSession};
use fota_core::transport::HttpClientTransport;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Firmware-over-HTTPS update tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download a firmware image and apply it to a partition file
    Update {
        /// Image URL
        url: String,

        /// Path of the partition image file to write
        #[arg(long, default_value = "ota_1.bin")]
        flash_image: PathBuf,

        /// Partition capacity in bytes
        #[arg(long, default_value_t = 4 * 1024 * 1024)]
        capacity: u64,

        /// Chip id of the simulated running hardware
        #[arg(long, default_value_t = 1)]
        chip_id: u16,

        /// Chip revision of the simulated running hardware
        #[arg(long, default_value_t = 0)]
        chip_rev: u16,

        /// Download over successive ranged requests
        #[arg(long)]
        partial: bool,

        /// Window cap for partial download, in bytes
        #[arg(long, default_value_t = 16 * 1024)]
        max_request_size: u32,

        /// Erase the whole partition up front
        #[arg(long)]
        bulk_erase: bool,

        /// TOML config file; flags override its values
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Build a flashable image from a raw firmware payload
    Pack {
        /// Raw firmware payload
        payload: PathBuf,

        /// Output image path
        #[arg(short, long, default_value = "firmware.img")]
        output: PathBuf,

        /// Target chip id
        #[arg(long, default_value_t = 1)]
        chip_id: u16,

        /// Lowest supported chip revision
        #[arg(long, default_value_t = 0)]
        chip_rev_min: u16,

        /// Highest supported chip revision
        #[arg(long, default_value_t = u16::MAX)]
        chip_rev_max: u16,

        /// Firmware version string
        #[arg(long, default_value = "0.0.0")]
        fw_version: String,

        /// Project name
        #[arg(long, default_value = "firmware")]
        project: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let result = match cli.command {
        Commands::Update {
            url,
            flash_image,
            capacity,
            chip_id,
            chip_rev,
            partial,
            max_request_size,
            bulk_erase,
            config,
        } => update(
            &url,
            &flash_image,
            capacity,
            TargetInfo { chip_id, chip_rev },
            partial,
            max_request_size,
            bulk_erase,
            config.as_deref(),
        ),
        Commands::Pack {
            payload,
            output,
            chip_id,
            chip_rev_min,
            chip_rev_max,
            fw_version,
            project,
        } => pack(
            &payload,
            &output,
            chip_id,
            chip_rev_min,
            chip_rev_max,
            &fw_version,
            &project,
        ),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[allow(clippy::too_many_arguments)]
fn update(
    url: &str,
    flash_image: &Path,
    capacity: u64,
    target: TargetInfo,
    partial: bool,
    max_request_size: u32,
    bulk_erase: bool,
    config_path: Option<&Path>,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => OtaConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => OtaConfig::default(),
    };
    config.target = target;
    config.partial_http_download = partial;
    config.max_http_request_size = max_request_size;
    config.bulk_flash_erase = bulk_erase;

    let timeout = Duration::from_millis(config.http.timeout_ms);
    let transport = HttpClientTransport::new(url, timeout).context("building transport")?;
    let flash = FileFlash::create(flash_image, capacity)
        .with_context(|| format!("creating partition image {}", flash_image.display()))?;
    let boot = StaticBootLayout::two_slot(capacity);

    info!(url = %url, image = %flash_image.display(), "Starting update");
    let mut session =
        UpdateSession::begin(config, transport, Box::new(flash), Box::new(boot.clone()))
            .context("starting update session")?;

    let descriptor = session.image_descriptor().context("reading image header")?;
    info!(
        version = %descriptor.version,
        project = %descriptor.project_name,
        built = %format!("{} {}", descriptor.build_date, descriptor.build_time),
        "Incoming image"
    );

    while session.perform().context("transferring image")? == OtaProgress::Continue {
        if let Some(total) = session.image_size() {
            let pct = session.bytes_read() * 100 / total.max(1);
            info!("{}% ({}/{} bytes)", pct, session.bytes_read(), total);
        } else {
            info!("{} bytes", session.bytes_read());
        }
    }

    session.finish().context("finalizing update")?;
    match boot.next_boot() {
        Some(label) => info!(partition = %label, "Update complete, next boot target set"),
        None => info!("Update complete"),
    }
    Ok(())
}

fn pack(
    payload_path: &Path,
    output: &Path,
    chip_id: u16,
    chip_rev_min: u16,
    chip_rev_max: u16,
    fw_version: &str,
    project: &str,
) -> Result<()> {
    let payload = std::fs::read(payload_path)
        .with_context(|| format!("reading payload {}", payload_path.display()))?;

    let now = chrono::Local::now();
    let builder = ImageBuilder {
        chip_id,
        chip_rev_min,
        chip_rev_max,
        version: fw_version.to_string(),
        project_name: project.to_string(),
        build_date: now.format("%Y-%m-%d").to_string(),
        build_time: now.format("%H:%M:%S").to_string(),
    };
    let image = builder.build(&payload);

    std::fs::write(output, &image)
        .with_context(|| format!("writing image {}", output.display()))?;
    info!(
        output = %output.display(),
        payload = payload.len(),
        total = image.len(),
        "Image packed"
    );
    Ok(())
}
