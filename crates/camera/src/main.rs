//! uvc-stream
//!
//! Command-line front end for the UVC streaming engine: lists cameras and
//! their profiles, or streams one profile and reports throughput.

use anyhow::{Context, Result, anyhow};
use camera::{
    CameraError, EngineConfig, Frame, PowerState, RusbTransport, UvcDevice, list_video_devices,
};
use clap::Parser;
use common::setup_logging;
use protocol::StreamProfile;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "uvc-stream")]
#[command(author, version, about = "Stream video from USB Video Class cameras")]
#[command(long_about = "
Negotiates a stream with a USB Video Class camera over libusb and reports
frame throughput.

EXAMPLES:
    # List connected cameras
    uvc-stream --list-devices

    # List the profiles a camera supports
    uvc-stream --device 046d:0825 --list-profiles

    # Stream 640x480 YUYV at 30 fps for ten seconds
    uvc-stream --device 046d:0825 --profile YUYV:640x480@30 --duration 10

CONFIGURATION:
    The engine looks for configuration in the following order:
    1. Path specified with --config
    2. ~/.config/uvc-stream/engine.toml
    3. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List video devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Camera to open, as VID:PID in hex
    #[arg(short, long, value_name = "VID:PID")]
    device: Option<String>,

    /// List the camera's stream profiles and exit
    #[arg(long)]
    list_profiles: bool,

    /// Profile to stream, e.g. YUYV:640x480@30 (first advertised if omitted)
    #[arg(short, long, value_name = "PROFILE")]
    profile: Option<String>,

    /// Stop after this many seconds (runs until Ctrl+C if omitted)
    #[arg(long, value_name = "SECONDS")]
    duration: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = EngineConfig::default();
        let path = EngineConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        EngineConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        EngineConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.engine.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("uvc-stream v{}", env!("CARGO_PKG_VERSION"));

    if args.list_devices {
        return list_devices_mode().await;
    }

    let device_id = args
        .device
        .as_deref()
        .ok_or_else(|| anyhow!("--device VID:PID is required"))?;
    let (vendor_id, product_id) = parse_device_id(device_id)?;

    let transport = tokio::task::spawn_blocking(move || RusbTransport::open(vendor_id, product_id))
        .await
        .context("USB open task failed")?
        .with_context(|| format!("Failed to open {}", device_id))?;
    let control_interface = transport.control_interface();
    let device = Arc::new(UvcDevice::new(Arc::new(transport), control_interface, &config));

    blocking({
        let device = Arc::clone(&device);
        move || device.set_power_state(PowerState::D0)
    })
    .await
    .context("Failed to power up camera")?;

    let profiles = blocking({
        let device = Arc::clone(&device);
        move || device.get_profiles()
    })
    .await?;

    let result = if args.list_profiles {
        print_profiles(&profiles);
        Ok(())
    } else {
        let profile = match args.profile.as_deref() {
            Some(text) => text
                .parse::<StreamProfile>()
                .with_context(|| format!("Invalid profile '{}'", text))?,
            None => *profiles
                .first()
                .ok_or_else(|| anyhow!("Camera advertises no profiles"))?,
        };
        stream_mode(Arc::clone(&device), profile, args.duration.map(Duration::from_secs)).await
    };

    info!("Powering down camera...");
    if let Err(e) = blocking(move || device.set_power_state(PowerState::D3)).await {
        error!("Error powering down camera: {:#}", e);
    }

    result
}

/// Run a blocking engine call off the async runtime
async fn blocking<T, F>(call: F) -> Result<T>
where
    F: FnOnce() -> camera::Result<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(call)
        .await
        .context("Engine task failed")??)
}

fn parse_device_id(text: &str) -> Result<(u16, u16)> {
    let (vid, pid) = text
        .split_once(':')
        .ok_or_else(|| anyhow!("Expected VID:PID, got '{}'", text))?;
    let vid = u16::from_str_radix(vid, 16).with_context(|| format!("Invalid vendor id '{}'", vid))?;
    let pid = u16::from_str_radix(pid, 16).with_context(|| format!("Invalid product id '{}'", pid))?;
    Ok((vid, pid))
}

async fn list_devices_mode() -> Result<()> {
    let devices = tokio::task::spawn_blocking(list_video_devices)
        .await
        .context("USB enumeration task failed")?
        .context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No video devices found.");
    } else {
        println!("Found {} video device(s):\n", devices.len());
        for device in devices {
            println!(
                "  {:04x}:{:04x} - {}",
                device.vendor_id,
                device.product_id,
                device.product.as_deref().unwrap_or("Unknown Product")
            );
            println!(
                "      Bus {:03} Device {:03} Control interface {}",
                device.bus_number, device.address, device.control_interface
            );
        }
    }
    Ok(())
}

fn print_profiles(profiles: &[StreamProfile]) {
    if profiles.is_empty() {
        println!("No stream profiles advertised.");
        return;
    }
    println!("{} profile(s):", profiles.len());
    for profile in profiles {
        println!("  {}", profile);
    }
}

async fn stream_mode(
    device: Arc<UvcDevice>,
    profile: StreamProfile,
    duration: Option<Duration>,
) -> Result<()> {
    let (frame_tx, frame_rx) = async_channel::bounded::<Frame>(8);
    let (error_tx, error_rx) = async_channel::unbounded::<CameraError>();

    blocking({
        let device = Arc::clone(&device);
        move || {
            device.probe_and_commit(profile, move |frame| {
                // Newest frame wins when the consumer falls behind
                let _ = frame_tx.force_send(frame);
            })?;
            device.stream_on(move |e| {
                let _ = error_tx.try_send(e);
            })
        }
    })
    .await
    .with_context(|| format!("Failed to start {}", profile))?;

    info!("Streaming {} (Ctrl+C to stop)", profile);

    let started = Instant::now();
    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;
    let mut frames = 0u64;
    let mut bytes = 0u64;
    let mut last_sequence = None;

    loop {
        tokio::select! {
            Ok(frame) = frame_rx.recv() => {
                frames += 1;
                bytes += frame.pixel_len() as u64;
                last_sequence = Some(frame.sequence());
            }
            Ok(e) = error_rx.recv() => {
                error!("Stream error: {}", e);
                if matches!(e, CameraError::DeviceDisconnected) {
                    break;
                }
            }
            _ = ticker.tick() => {
                let device = Arc::clone(&device);
                match blocking(move || device.stats(profile)).await {
                    Ok(stats) => println!(
                        "{:>6.1}s  {} frames ({:.1} MB)  last #{}  dropped: {} invalid, {} no buffer, {} evicted",
                        started.elapsed().as_secs_f64(),
                        frames,
                        bytes as f64 / 1_000_000.0,
                        last_sequence.map_or_else(|| "-".to_string(), |s| s.to_string()),
                        stats.dropped_invalid,
                        stats.dropped_no_buffer,
                        stats.queue_evictions
                    ),
                    Err(e) => warn!("Could not read stream stats: {:#}", e),
                }
            }
            _ = &mut deadline => {
                info!("Duration elapsed");
                break;
            }
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping");
                break;
            }
        }
    }

    let device = Arc::clone(&device);
    if let Err(e) = blocking(move || device.close(profile)).await {
        warn!("Failed to close stream: {:#}", e);
    }
    println!("Received {} frames in {:.1}s", frames, started.elapsed().as_secs_f64());
    Ok(())
}
