use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use faceguide_hw::{CameraSession, V4lCamera};
use std::path::PathBuf;
use std::time::Duration;

#[zbus::proxy(
    interface = "org.faceguide.Kiosk1",
    default_service = "org.faceguide.Kiosk1",
    default_path = "/org/faceguide/Kiosk1"
)]
trait Kiosk {
    async fn reset(&self) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "faceguide", about = "faceguide kiosk control and diagnostics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show kiosk status
    Status,
    /// Clear the current result and resume tracking
    Reset,
    /// List V4L2 capture devices
    Devices,
    /// Open the camera directly and wait for usable frames
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 640)]
        width: u32,
        #[arg(long, default_value_t = 480)]
        height: u32,
        /// Readiness polls before giving up
        #[arg(long, default_value_t = 20)]
        attempts: u32,
        /// Save the first usable frame as JPEG
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Commands::Status => {
            let proxy = connect().await?;
            let raw = proxy.status().await.context("Status call failed")?;
            let value: serde_json::Value =
                serde_json::from_str(&raw).context("daemon returned invalid status")?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Reset => {
            connect().await?.reset().await.context("Reset call failed")?;
            println!("kiosk reset");
        }
        Commands::Devices => {
            let devices = V4lCamera::list_devices();
            if devices.is_empty() {
                println!("no capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Test {
            device,
            width,
            height,
            attempts,
            output,
        } => camera_test(device, width, height, attempts, output).await?,
    }

    Ok(())
}

async fn connect() -> Result<KioskProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to session bus")?;
    KioskProxy::new(&conn)
        .await
        .context("faceguided is not running")
}

async fn camera_test(
    device: String,
    width: u32,
    height: u32,
    attempts: u32,
    output: Option<PathBuf>,
) -> Result<()> {
    println!("opening {device} at {width}x{height}...");
    let mut session = CameraSession::new(V4lCamera::new(device, width, height));
    let (w, h) = session
        .wait_ready(attempts, Duration::from_millis(100))
        .await
        .context("camera did not become ready")?;
    println!("camera ready: {w}x{h}");

    if let Some(path) = output {
        let frame = session
            .latest_frame()
            .context("stream produced no frame")?;
        let jpeg = frame.encode_jpeg(90)?;
        std::fs::write(&path, jpeg)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("saved frame {} to {}", frame.sequence, path.display());
    }

    session.teardown(None);
    Ok(())
}
