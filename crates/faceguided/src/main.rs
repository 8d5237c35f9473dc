use anyhow::{Context, Result};
use faceguide_core::OnnxDetector;
use faceguide_hw::{CameraSession, V4lCamera};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod driver;
mod engine;
mod matcher;
mod presenter;

use config::Config;
use driver::{Driver, DriverConfig};
use matcher::HttpMatchClient;
use presenter::LogPresenter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("faceguided starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        profile = ?config.profile,
        camera = %config.camera.device,
        interval_ms = config.active_capture().interval_ms,
        match_url = %config.matcher.base_url,
        "configuration loaded"
    );

    let detector = OnnxDetector::load(&config.scrfd_model_path(), &config.arcface_model_path())
        .context("failed to load face models")?;
    let detector = engine::spawn_detector(detector)?;

    let matcher = HttpMatchClient::new(&config.matcher.base_url, config.match_timeout())
        .context("failed to build match client")?;

    let camera = CameraSession::new(V4lCamera::new(
        config.camera.device.clone(),
        config.camera.width,
        config.camera.height,
    ));
    let presenter = LogPresenter::new(config.preview_path.clone());

    let (driver, handle) = Driver::new(
        DriverConfig::from_config(&config),
        camera,
        detector,
        matcher,
        presenter,
    );

    let _conn = dbus_interface::serve(handle.clone())
        .await
        .context("failed to register D-Bus service")?;
    tracing::info!(bus = dbus_interface::BUS_NAME, "faceguided ready");

    let run = tokio::spawn(driver.run());
    tokio::signal::ctrl_c().await?;
    tracing::info!("faceguided shutting down");
    let _ = handle.shutdown().await;
    run.await?;

    Ok(())
}
