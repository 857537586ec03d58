//! # D-Bus Client Module
//!
//! Client side of the wallpaper service, used by the CLI to drive a running
//! daemon instead of touching the config file behind its back.
//!
//! ```ignore
//! if let Some(client) = WallpaperClient::connect_running().await? {
//!     println!("{}", client.update_now("").await?);
//! }
//! ```

use zbus::{fdo::DBusProxy, names::BusName, proxy, Connection};

use crate::service::{ScheduleInfo, SERVICE_NAME};

/// D-Bus proxy for the wallpaper service
#[proxy(
    interface = "org.pixelpull.Wallpaper1",
    default_service = "org.pixelpull.Wallpaper1",
    default_path = "/org/pixelpull/Wallpaper1"
)]
trait WallpaperService {
    /// Optionally save a new URL, then fetch and apply
    async fn update_now(&self, url: &str) -> zbus::Result<String>;

    async fn get_url(&self) -> zbus::Result<String>;

    async fn set_url(&self, url: &str) -> zbus::Result<()>;

    async fn get_schedule(&self) -> zbus::Result<ScheduleInfo>;

    /// Save a daily update time and arm it
    async fn set_schedule(&self, hour: u8, minute: u8) -> zbus::Result<ScheduleInfo>;

    async fn disable_schedule(&self) -> zbus::Result<()>;

    async fn get_target(&self) -> zbus::Result<String>;

    async fn set_target(&self, target: &str) -> zbus::Result<()>;

    /// Status text of the last interactive update
    async fn get_status(&self) -> zbus::Result<String>;

    // === Signals ===

    #[zbus(signal)]
    async fn wallpaper_changed(&self, url: String) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn schedule_changed(&self, enabled: bool, next_run: String) -> zbus::Result<()>;
}

/// High-level client for the wallpaper daemon
pub struct WallpaperClient {
    proxy: WallpaperServiceProxy<'static>,
}

impl WallpaperClient {
    /// Connect to the daemon if one owns the service name.
    ///
    /// Returns `Ok(None)` when the session bus is reachable but no daemon is
    /// running.
    pub async fn connect_running() -> zbus::Result<Option<Self>> {
        let connection = Connection::session().await?;
        let dbus = DBusProxy::new(&connection).await?;
        if !dbus.name_has_owner(BusName::try_from(SERVICE_NAME)?).await? {
            return Ok(None);
        }

        let proxy = WallpaperServiceProxy::new(&connection).await?;
        Ok(Some(Self { proxy }))
    }

    /// Fetch and apply now; a non-empty `url` is saved first.
    pub async fn update_now(&self, url: &str) -> zbus::Result<String> {
        self.proxy.update_now(url).await
    }

    pub async fn get_url(&self) -> zbus::Result<String> {
        self.proxy.get_url().await
    }

    pub async fn set_url(&self, url: &str) -> zbus::Result<()> {
        self.proxy.set_url(url).await
    }

    pub async fn get_schedule(&self) -> zbus::Result<ScheduleInfo> {
        self.proxy.get_schedule().await
    }

    pub async fn set_schedule(&self, hour: u8, minute: u8) -> zbus::Result<ScheduleInfo> {
        self.proxy.set_schedule(hour, minute).await
    }

    pub async fn disable_schedule(&self) -> zbus::Result<()> {
        self.proxy.disable_schedule().await
    }

    pub async fn get_target(&self) -> zbus::Result<String> {
        self.proxy.get_target().await
    }

    pub async fn set_target(&self, target: &str) -> zbus::Result<()> {
        self.proxy.set_target(target).await
    }

    pub async fn get_status(&self) -> zbus::Result<String> {
        self.proxy.get_status().await
    }
}
