//! Desktop notifications for scheduled updates.
//!
//! Sent over the `org.freedesktop.Notifications` D-Bus interface. Delivery is
//! best-effort: failures are logged and otherwise ignored.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tracing::{debug, warn};
use zbus::{proxy, zvariant::Value, Connection};

use crate::fetcher::{FetchError, FetchOutcome};

const APP_NAME: &str = "PixelPull";

/// Fire-and-forget notification surface.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, body: &str);
}

#[proxy(
    interface = "org.freedesktop.Notifications",
    default_service = "org.freedesktop.Notifications",
    default_path = "/org/freedesktop/Notifications"
)]
trait Notifications {
    async fn notify(
        &self,
        app_name: &str,
        replaces_id: u32,
        app_icon: &str,
        summary: &str,
        body: &str,
        actions: &[&str],
        hints: &HashMap<&str, &Value<'_>>,
        expire_timeout: i32,
    ) -> zbus::Result<u32>;
}

/// Notifier that talks to the session's notification daemon.
///
/// Each notification replaces the previous one so failures do not pile up.
pub struct DesktopNotifier {
    proxy: Option<NotificationsProxy<'static>>,
    last_id: AtomicU32,
}

impl DesktopNotifier {
    /// Connects to the session bus. Without a bus the notifier stays silent.
    pub async fn connect() -> Self {
        let proxy = match Connection::session().await {
            Ok(conn) => match NotificationsProxy::new(&conn).await {
                Ok(proxy) => Some(proxy),
                Err(e) => {
                    warn!(error = %e, "notification service unavailable");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "could not connect to the session bus for notifications");
                None
            }
        };

        Self { proxy, last_id: AtomicU32::new(0) }
    }
}

#[async_trait]
impl Notifier for DesktopNotifier {
    async fn notify(&self, title: &str, body: &str) {
        let Some(proxy) = &self.proxy else {
            debug!(title, "notification dropped, no notification service");
            return;
        };

        let replaces = self.last_id.load(Ordering::SeqCst);
        match proxy
            .notify(APP_NAME, replaces, "preferences-desktop-wallpaper", title, body, &[], &HashMap::new(), -1)
            .await
        {
            Ok(id) => self.last_id.store(id, Ordering::SeqCst),
            Err(e) => warn!(error = %e, "failed to show notification"),
        }
    }
}

/// Title and body announcing `outcome`, or `None` if it is not worth telling
/// the user about.
pub fn notification_for(outcome: &FetchOutcome) -> Option<(&'static str, String)> {
    match outcome {
        FetchOutcome::Success => Some(("Wallpaper Updated", "Your wallpaper was updated successfully".to_string())),
        FetchOutcome::Failure(error) => {
            let title = match error {
                FetchError::Network(_) => "No Internet Connection",
                FetchError::HttpStatus { .. } => "Download Failed",
                FetchError::Decode(_) => "Invalid Image",
                FetchError::Apply(_) => "Wallpaper Update Failed",
            };
            Some((title, format!("Couldn't update your wallpaper automatically: {error}")))
        }
        FetchOutcome::Skipped(_) => None,
    }
}
