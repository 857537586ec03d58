//! # Desktop Wallpaper Backends
//!
//! The [`WallpaperSetter`] used outside of tests. The decoded image is written
//! to a staging file under `~/.local/share/pixelpull/` and the running desktop
//! is pointed at it:
//!
//! - **COSMIC**: rewrites the `cosmic-bg` config and restarts `cosmic-bg`.
//!   COSMIC has a single background, so every target lands there.
//! - **GNOME**: `gsettings` keys for the desktop background (home) and the
//!   screensaver (lock).
//!
//! A failed apply puts every setting it touched back the way it was, so the
//! previous wallpaper stays in place and the staged file can be discarded.
//!
//! Each apply writes a new file so that desktops which cache by path notice
//! the change. Only the most recent staged file is kept.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use chrono::Local;
use image::{DynamicImage, ImageFormat};
use tracing::{debug, warn};

use crate::config::WallpaperTarget;
use crate::fetcher::WallpaperSetter;

const STAGED_PREFIX: &str = "wallpaper-";
const STAGED_EXTENSION: &str = "png";

const GNOME_BACKGROUND: &str = "org.gnome.desktop.background";
const GNOME_SCREENSAVER: &str = "org.gnome.desktop.screensaver";

/// How long the COSMIC session gets to restart cosmic-bg on its own
const COSMIC_RESTART_WAIT: Duration = Duration::from_millis(1000);

/// Check if running inside a Flatpak sandbox
pub fn is_flatpak() -> bool {
    Path::new("/.flatpak-info").exists()
}

/// Desktop environments we know how to drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Desktop {
    Cosmic,
    Gnome,
    Other(String),
}

impl Desktop {
    /// Reads `XDG_CURRENT_DESKTOP` (a colon separated list, e.g. `ubuntu:GNOME`).
    pub fn detect() -> Self {
        Self::from_current_desktop(&std::env::var("XDG_CURRENT_DESKTOP").unwrap_or_default())
    }

    fn from_current_desktop(value: &str) -> Self {
        let upper = value.to_ascii_uppercase();
        let names: Vec<&str> = upper.split(':').map(str::trim).collect();
        if names.contains(&"COSMIC") {
            Self::Cosmic
        } else if names.contains(&"GNOME") {
            Self::Gnome
        } else {
            Self::Other(value.to_string())
        }
    }

    /// Whether this desktop has a lock screen image separate from the background.
    pub fn has_lock_screen(&self) -> bool {
        matches!(self, Self::Gnome)
    }
}

/// Runs desktop helper programs on the host, through `flatpak-spawn --host`
/// when sandboxed.
#[derive(Debug, Clone, Default)]
pub struct HostShell {
    /// Look programs up here instead of on `PATH`
    bin_dir: Option<PathBuf>,
}

impl HostShell {
    #[cfg(test)]
    fn with_bin_dir(dir: impl Into<PathBuf>) -> Self {
        Self { bin_dir: Some(dir.into()) }
    }

    fn command(&self, program: &str) -> Command {
        let program: OsString = match &self.bin_dir {
            Some(dir) => dir.join(program).into_os_string(),
            None => program.into(),
        };

        if is_flatpak() {
            let mut cmd = Command::new("flatpak-spawn");
            cmd.arg("--host").arg(program);
            cmd
        } else {
            Command::new(program)
        }
    }

    fn run(&self, program: &str, args: &[&str]) -> io::Result<Output> {
        self.command(program).args(args).output()
    }

    /// Starts a long-running program without waiting for it. A background
    /// thread reaps it once it exits.
    fn spawn_detached(&self, program: &str) -> io::Result<()> {
        let mut child = self.command(program).spawn()?;
        std::thread::spawn(move || {
            let _ = child.wait();
        });
        Ok(())
    }
}

/// Sets the wallpaper of the running desktop session.
#[derive(Debug, Clone)]
pub struct DesktopSetter {
    image_dir: PathBuf,
    host: HostShell,
}

impl DesktopSetter {
    pub fn new(image_dir: impl Into<PathBuf>) -> Self {
        Self { image_dir: image_dir.into(), host: HostShell::default() }
    }

    /// Stages images under `~/.local/share/pixelpull/`.
    pub fn with_default_dir() -> Self {
        let base = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
        Self::new(base.join(crate::config::APP_DIR_NAME))
    }

    #[cfg(test)]
    fn with_host(mut self, host: HostShell) -> Self {
        self.host = host;
        self
    }

    /// Writes `image` to a fresh file in the staging directory.
    fn stage(&self, image: &DynamicImage) -> Result<PathBuf, String> {
        std::fs::create_dir_all(&self.image_dir)
            .map_err(|e| format!("Failed to create wallpaper directory: {e}"))?;

        let filename = format!(
            "{}{}.{}",
            STAGED_PREFIX,
            Local::now().format("%Y%m%d-%H%M%S%3f"),
            STAGED_EXTENSION
        );
        let path = self.image_dir.join(filename);
        image
            .save_with_format(&path, ImageFormat::Png)
            .map_err(|e| format!("Failed to save wallpaper image: {e}"))?;
        Ok(path)
    }

    fn apply_on(&self, desktop: &Desktop, image: &DynamicImage, target: WallpaperTarget) -> Result<(), String> {
        if target.includes_lock() && !desktop.has_lock_screen() {
            debug!(?desktop, "no separate lock screen, applying to the desktop background");
        }

        let path = self.stage(image)?;
        if let Err(e) = self.apply_to(desktop, &path, target) {
            // The backend restored its previous settings, nothing refers to the file
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        let removed = remove_stale_images(&self.image_dir, &path);
        if removed > 0 {
            debug!(removed, "removed previous staged wallpapers");
        }
        Ok(())
    }

    fn apply_to(&self, desktop: &Desktop, path: &Path, target: WallpaperTarget) -> Result<(), String> {
        match desktop {
            Desktop::Cosmic => apply_cosmic_wallpaper(&self.host, &cosmic_config_path()?, path),
            Desktop::Gnome => apply_gnome_wallpaper(&self.host, path, target),
            Desktop::Other(name) if name.is_empty() => {
                Err("No desktop session detected (XDG_CURRENT_DESKTOP is unset)".to_string())
            }
            Desktop::Other(name) => Err(format!("Setting the wallpaper is not supported on {name}")),
        }
    }
}

impl WallpaperSetter for DesktopSetter {
    fn apply(&self, image: &DynamicImage, target: WallpaperTarget) -> Result<(), String> {
        self.apply_on(&Desktop::detect(), image, target)
    }
}

/// Deletes every staged wallpaper in `dir` except `keep`.
fn remove_stale_images(dir: &Path, keep: &Path) -> usize {
    let mut deleted = 0;

    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path == keep {
                continue;
            }

            let is_staged = path
                .file_name()
                .and_then(|s| s.to_str())
                .map(|name| name.starts_with(STAGED_PREFIX) && name.ends_with(STAGED_EXTENSION))
                .unwrap_or(false);

            if is_staged && std::fs::remove_file(&path).is_ok() {
                deleted += 1;
            }
        }
    }

    deleted
}

// === COSMIC ===

/// cosmic-bg reads the host's `~/.config`, which `dirs::config_dir()` does
/// not return inside a Flatpak sandbox.
fn cosmic_config_path() -> Result<PathBuf, String> {
    dirs::home_dir()
        .map(|home| cosmic_config_path_in(&home))
        .ok_or_else(|| "Could not find home directory".to_string())
}

fn cosmic_config_path_in(home: &Path) -> PathBuf {
    home.join(".config/cosmic/com.system76.CosmicBackground/v1/all")
}

fn cosmic_background_config(image_path: &Path) -> String {
    format!(
        r#"(
    output: "all",
    source: Path("{}"),
    filter_by_theme: false,
    rotation_frequency: 300,
    filter_method: Lanczos,
    scaling_mode: Zoom,
    sampling_method: Alphanumeric,
)"#,
        image_path.display()
    )
}

/// Apply wallpaper to COSMIC desktop
fn apply_cosmic_wallpaper(host: &HostShell, config_path: &Path, image_path: &Path) -> Result<(), String> {
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("Failed to create config dir: {e}"))?;
    }

    let previous = std::fs::read_to_string(config_path).ok();

    std::fs::write(config_path, cosmic_background_config(image_path))
        .map_err(|e| format!("Failed to write cosmic-bg config: {e}"))?;

    if let Err(e) = restart_cosmic_bg(host) {
        match previous {
            Some(previous) => {
                let _ = std::fs::write(config_path, previous);
            }
            None => {
                let _ = std::fs::remove_file(config_path);
            }
        }
        return Err(e);
    }
    Ok(())
}

/// cosmic-bg only reads its config at start-up. The session restarts it
/// after a SIGTERM; we start it ourselves only if nothing came back.
fn restart_cosmic_bg(host: &HostShell) -> Result<(), String> {
    let _ = host.run("pkill", &["-TERM", "-x", "cosmic-bg"]);

    std::thread::sleep(COSMIC_RESTART_WAIT);

    match host.run("pgrep", &["-x", "cosmic-bg"]) {
        Ok(output) if output.status.success() => Ok(()),
        _ => {
            debug!("cosmic-bg was not restarted by the session, starting it");
            host.spawn_detached("cosmic-bg")
                .map_err(|e| format!("Failed to start cosmic-bg: {e}"))?;
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        }
    }
}

// === GNOME ===

fn gsettings_get(host: &HostShell, schema: &str, key: &str) -> Result<String, String> {
    let output = host
        .run("gsettings", &["get", schema, key])
        .map_err(|e| format!("Failed to run gsettings: {e}"))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(format!(
            "gsettings get {schema} {key} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

fn gsettings_set(host: &HostShell, schema: &str, key: &str, value: &str) -> Result<(), String> {
    let output = host
        .run("gsettings", &["set", schema, key, value])
        .map_err(|e| format!("Failed to run gsettings: {e}"))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(format!(
            "gsettings set {schema} {key} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ))
    }
}

/// Apply wallpaper to GNOME, honouring the home/lock selection.
///
/// Each key's old value is read before it is written. If a required key
/// cannot be written, the keys already changed are put back.
fn apply_gnome_wallpaper(host: &HostShell, image_path: &Path, target: WallpaperTarget) -> Result<(), String> {
    let uri = format!("file://{}", image_path.display());

    // (schema, key, value, required)
    let mut writes: Vec<(&str, &str, &str, bool)> = Vec::new();
    if target.includes_home() {
        writes.push((GNOME_BACKGROUND, "picture-uri", uri.as_str(), true));
        // Only present on GNOME 42+
        writes.push((GNOME_BACKGROUND, "picture-uri-dark", uri.as_str(), false));
        writes.push((GNOME_BACKGROUND, "picture-options", "zoom", false));
    }
    if target.includes_lock() {
        writes.push((GNOME_SCREENSAVER, "picture-uri", uri.as_str(), true));
    }

    let mut changed: Vec<(&str, &str, String)> = Vec::new();
    for (schema, key, value, required) in writes {
        let result = gsettings_get(host, schema, key).and_then(|previous| {
            gsettings_set(host, schema, key, value)?;
            Ok(previous)
        });

        match result {
            Ok(previous) => changed.push((schema, key, previous)),
            Err(e) if !required => warn!(error = %e, "skipping optional GNOME wallpaper setting"),
            Err(e) => {
                restore_gsettings(host, &changed);
                return Err(e);
            }
        }
    }

    Ok(())
}

fn restore_gsettings(host: &HostShell, changed: &[(&str, &str, String)]) {
    for (schema, key, previous) in changed.iter().rev() {
        if let Err(e) = gsettings_set(host, schema, key, previous) {
            warn!(error = %e, "could not restore previous GNOME wallpaper setting");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Writes an executable shell script named `name` into `dir`.
    fn fake_program(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn log_lines(log: &Path) -> Vec<String> {
        std::fs::read_to_string(log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn staged_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == STAGED_EXTENSION))
            .collect()
    }

    /// Fake gsettings that logs calls, reports fixed old values and refuses
    /// writes to every schema listed in `read_only`.
    fn fake_gsettings(bin: &Path, log: &Path, read_only: &[&str]) {
        let mut refuse = String::new();
        for schema in read_only {
            refuse.push_str(&format!(
                "if [ \"$1\" = set ] && [ \"$2\" = {schema} ]; then echo 'key is not writable' >&2; exit 1; fi\n"
            ));
        }
        fake_program(
            bin,
            "gsettings",
            &format!(
                r#"echo "$*" >> {log}
{refuse}if [ "$1" = get ]; then
  case "$2 $3" in
    "{GNOME_BACKGROUND} picture-uri") echo "'file:///old/home.png'" ;;
    "{GNOME_BACKGROUND} picture-uri-dark") echo "'file:///old/dark.png'" ;;
    "{GNOME_BACKGROUND} picture-options") echo "'scaled'" ;;
    "{GNOME_SCREENSAVER} picture-uri") echo "'file:///old/lock.png'" ;;
  esac
fi"#,
                log = log.display()
            ),
        );
    }

    #[test]
    fn test_detect_desktop_from_session_list() {
        assert_eq!(Desktop::from_current_desktop("COSMIC"), Desktop::Cosmic);
        assert_eq!(Desktop::from_current_desktop("ubuntu:GNOME"), Desktop::Gnome);
        assert_eq!(Desktop::from_current_desktop("KDE"), Desktop::Other("KDE".to_string()));
        assert_eq!(Desktop::from_current_desktop(""), Desktop::Other(String::new()));
    }

    #[test]
    fn test_only_gnome_has_lock_screen() {
        assert!(Desktop::Gnome.has_lock_screen());
        assert!(!Desktop::Cosmic.has_lock_screen());
    }

    #[test]
    fn test_cosmic_config_points_at_image() {
        let config = cosmic_background_config(Path::new("/tmp/pixelpull/wallpaper-1.png"));
        assert!(config.contains(r#"source: Path("/tmp/pixelpull/wallpaper-1.png")"#));
        assert!(config.contains("scaling_mode: Zoom"));
    }

    #[test]
    fn test_cosmic_config_lives_under_host_home() {
        assert_eq!(
            cosmic_config_path_in(Path::new("/home/ada")),
            PathBuf::from("/home/ada/.config/cosmic/com.system76.CosmicBackground/v1/all")
        );
    }

    #[test]
    fn test_unsupported_desktop_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let setter = DesktopSetter::new(dir.path());
        let result = setter.apply_on(&Desktop::Other("Sway".into()), &DynamicImage::new_rgb8(2, 2), WallpaperTarget::Home);

        assert!(result.unwrap_err().contains("Sway"));
        assert!(staged_files(dir.path()).is_empty());
    }

    #[test]
    fn test_remove_stale_images_keeps_current() {
        let dir = tempfile::tempdir().unwrap();
        let keep = dir.path().join("wallpaper-2.png");
        std::fs::write(dir.path().join("wallpaper-1.png"), b"old").unwrap();
        std::fs::write(&keep, b"new").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"unrelated").unwrap();

        assert_eq!(remove_stale_images(dir.path(), &keep), 1);
        assert!(keep.exists());
        assert!(dir.path().join("notes.txt").exists());
        assert!(!dir.path().join("wallpaper-1.png").exists());
    }

    #[test]
    fn test_gnome_both_sets_background_and_screensaver() {
        let bin = tempfile::tempdir().unwrap();
        let images = tempfile::tempdir().unwrap();
        let log = bin.path().join("calls.log");
        fake_gsettings(bin.path(), &log, &[]);

        let setter = DesktopSetter::new(images.path()).with_host(HostShell::with_bin_dir(bin.path()));
        setter
            .apply_on(&Desktop::Gnome, &DynamicImage::new_rgb8(2, 2), WallpaperTarget::Both)
            .unwrap();

        let staged = staged_files(images.path());
        assert_eq!(staged.len(), 1);
        let uri = format!("file://{}", staged[0].display());
        let calls = log_lines(&log);
        assert!(calls.contains(&format!("set {GNOME_BACKGROUND} picture-uri {uri}")));
        assert!(calls.contains(&format!("set {GNOME_SCREENSAVER} picture-uri {uri}")));
    }

    #[test]
    fn test_gnome_lock_failure_restores_background() {
        let bin = tempfile::tempdir().unwrap();
        let images = tempfile::tempdir().unwrap();
        let log = bin.path().join("calls.log");
        fake_gsettings(bin.path(), &log, &[GNOME_SCREENSAVER]);

        let setter = DesktopSetter::new(images.path()).with_host(HostShell::with_bin_dir(bin.path()));
        let result = setter.apply_on(&Desktop::Gnome, &DynamicImage::new_rgb8(2, 2), WallpaperTarget::Both);

        assert!(result.unwrap_err().contains(GNOME_SCREENSAVER));

        let calls = log_lines(&log);
        let last_set = |key: &str| {
            let prefix = format!("set {GNOME_BACKGROUND} {key} ");
            calls.iter().rev().find(|c| c.starts_with(&prefix)).cloned().unwrap()
        };
        assert_eq!(last_set("picture-uri"), format!("set {GNOME_BACKGROUND} picture-uri 'file:///old/home.png'"));
        assert_eq!(last_set("picture-uri-dark"), format!("set {GNOME_BACKGROUND} picture-uri-dark 'file:///old/dark.png'"));
        assert_eq!(last_set("picture-options"), format!("set {GNOME_BACKGROUND} picture-options 'scaled'"));
        assert!(staged_files(images.path()).is_empty());
    }

    #[test]
    fn test_gnome_home_failure_changes_nothing() {
        let bin = tempfile::tempdir().unwrap();
        let images = tempfile::tempdir().unwrap();
        let log = bin.path().join("calls.log");
        fake_gsettings(bin.path(), &log, &[GNOME_BACKGROUND]);

        let setter = DesktopSetter::new(images.path()).with_host(HostShell::with_bin_dir(bin.path()));
        let result = setter.apply_on(&Desktop::Gnome, &DynamicImage::new_rgb8(2, 2), WallpaperTarget::Both);

        assert!(result.is_err());
        assert!(!log_lines(&log).iter().any(|c| c.starts_with(&format!("set {GNOME_SCREENSAVER}"))));
    }

    /// Fake pkill/pgrep/cosmic-bg that log their calls. `pgrep` finds a
    /// running cosmic-bg when `restarted_by_session` is set.
    fn fake_cosmic_tools(bin: &Path, log: &Path, restarted_by_session: bool) {
        let log = log.display();
        fake_program(bin, "pkill", &format!("echo \"pkill $*\" >> {log}"));
        let status = if restarted_by_session { 0 } else { 1 };
        fake_program(bin, "pgrep", &format!("echo \"pgrep $*\" >> {log}\nexit {status}"));
        fake_program(bin, "cosmic-bg", &format!("echo started >> {log}"));
    }

    #[test]
    fn test_cosmic_bg_restarted_by_session_is_not_spawned_again() {
        let bin = tempfile::tempdir().unwrap();
        let log = bin.path().join("calls.log");
        let config = bin.path().join("cosmic/all");
        fake_cosmic_tools(bin.path(), &log, true);

        apply_cosmic_wallpaper(&HostShell::with_bin_dir(bin.path()), &config, Path::new("/tmp/w.png")).unwrap();

        assert_eq!(log_lines(&log), vec!["pkill -TERM -x cosmic-bg", "pgrep -x cosmic-bg"]);
        assert!(std::fs::read_to_string(&config).unwrap().contains("/tmp/w.png"));
    }

    #[test]
    fn test_cosmic_bg_started_when_session_did_not_restart_it() {
        let bin = tempfile::tempdir().unwrap();
        let log = bin.path().join("calls.log");
        let config = bin.path().join("cosmic/all");
        fake_cosmic_tools(bin.path(), &log, false);

        apply_cosmic_wallpaper(&HostShell::with_bin_dir(bin.path()), &config, Path::new("/tmp/w.png")).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while !log_lines(&log).contains(&"started".to_string()) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(log_lines(&log).iter().filter(|c| c.as_str() == "started").count(), 1);
    }

    #[test]
    fn test_cosmic_config_restored_when_cosmic_bg_cannot_start() {
        let bin = tempfile::tempdir().unwrap();
        let config = bin.path().join("cosmic/all");
        fake_program(bin.path(), "pkill", "exit 0");
        fake_program(bin.path(), "pgrep", "exit 1");
        // No cosmic-bg program: spawning it fails
        std::fs::create_dir_all(config.parent().unwrap()).unwrap();
        std::fs::write(&config, "previous").unwrap();

        let result = apply_cosmic_wallpaper(&HostShell::with_bin_dir(bin.path()), &config, Path::new("/tmp/w.png"));

        assert!(result.unwrap_err().contains("cosmic-bg"));
        assert_eq!(std::fs::read_to_string(&config).unwrap(), "previous");
    }
}
