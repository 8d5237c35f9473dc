use crate::driver::KioskHandle;
use zbus::interface;

pub const BUS_NAME: &str = "org.faceguide.Kiosk1";
pub const OBJECT_PATH: &str = "/org/faceguide/Kiosk1";

/// D-Bus control surface for the kiosk.
///
/// Bus name: org.faceguide.Kiosk1
/// Object path: /org/faceguide/Kiosk1
pub struct KioskService {
    handle: KioskHandle,
}

impl KioskService {
    pub fn new(handle: KioskHandle) -> Self {
        Self { handle }
    }
}

#[interface(name = "org.faceguide.Kiosk1")]
impl KioskService {
    /// Clear the current capture or result and resume tracking. Retries
    /// camera startup after a failure.
    async fn reset(&self) -> zbus::fdo::Result<()> {
        tracing::info!("reset requested over D-Bus");
        self.handle
            .reset()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// JSON snapshot of the kiosk state.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let mut value = serde_json::to_value(self.handle.snapshot())
            .map_err(|e| zbus::fdo::Error::Failed(format!("failed to encode status: {e}")))?;
        value["version"] = env!("CARGO_PKG_VERSION").into();
        Ok(value.to_string())
    }
}

/// Claim the bus name and export the service on the session bus.
pub async fn serve(handle: KioskHandle) -> zbus::Result<zbus::Connection> {
    zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, KioskService::new(handle))?
        .build()
        .await
}
