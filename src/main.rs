//! # PixelPull
//!
//! Downloads a wallpaper image from a user-chosen URL and applies it to the
//! desktop, either on demand or once a day at a fixed local time.
//!
//! ## Architecture
//! One binary, two roles:
//!
//! - `pixelpull daemon` owns the daily alarm and serves the D-Bus interface
//! - every other subcommand is a client: it drives a running daemon over
//!   D-Bus, or acts on the config file directly when none is running
//!
//! Modules:
//! - `config.rs` - Persisted settings (URL, schedule, target)
//! - `fetcher.rs` - HTTP download, decode and apply pipeline
//! - `desktop.rs` - COSMIC and GNOME wallpaper backends
//! - `alarm.rs` - Exact and inexact wall-clock alarms
//! - `scheduler.rs` - Daily trigger computation and re-arming
//! - `notifier.rs` - Desktop notifications for scheduled runs
//! - `orchestrator.rs` - One update run, interactive or scheduled
//! - `service.rs` - D-Bus daemon
//! - `dbus_client.rs` - D-Bus client used by the CLI

mod alarm;
mod config;
mod dbus_client;
mod desktop;
mod fetcher;
mod notifier;
mod orchestrator;
mod scheduler;
mod service;

use std::error::Error;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::runtime::Handle;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::alarm::TokioAlarm;
use crate::config::{ConfigStore, ScheduleConfig, ScheduleTime, WallpaperTarget};
use crate::dbus_client::WallpaperClient;
use crate::desktop::DesktopSetter;
use crate::fetcher::{FetchOutcome, ReqwestClient, SkipReason, WallpaperFetcher};
use crate::notifier::DesktopNotifier;
use crate::orchestrator::{StatusBoard, Trigger, UpdateOrchestrator, STATUS_ENTER_URL, STATUS_FAILED, STATUS_UPDATED};
use crate::scheduler::Scheduler;

#[derive(Debug, Parser)]
#[command(name = "pixelpull", version, about = "Daily wallpaper from any image URL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the background service (daily alarm + D-Bus interface). The default.
    Daemon,
    /// Download and apply the wallpaper now
    Update {
        /// Save this URL as the wallpaper source first
        url: Option<String>,
    },
    /// Show or set the wallpaper source URL
    Url { url: Option<String> },
    /// Show or set the daily update time (24-hour HH:MM)
    Schedule {
        time: Option<ScheduleTime>,
        /// Turn the daily update off
        #[arg(long, conflicts_with = "time")]
        disable: bool,
    },
    /// Show or set which screen receives the wallpaper
    Target { target: Option<WallpaperTarget> },
    /// Show or set whether successful scheduled updates are announced
    Notify {
        #[arg(value_parser = clap::builder::BoolishValueParser::new())]
        enabled: Option<bool>,
    },
    /// Show settings, next scheduled run and last status
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match ConfigStore::open_default() {
        Ok(store) => run(Arc::new(store), cli.command.unwrap_or(Command::Daemon)).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Arc<ConfigStore>, command: Command) -> Result<(), Box<dyn Error>> {
    match command {
        Command::Daemon => service::run_daemon(config).await,
        Command::Update { url } => run_update(&config, daemon_client().await, url).await,
        Command::Url { url } => run_url(&config, daemon_client().await, url).await,
        Command::Schedule { time, disable } => run_schedule(&config, daemon_client().await, time, disable).await,
        Command::Target { target } => run_target(&config, daemon_client().await, target).await,
        Command::Notify { enabled } => run_notify(&config, enabled),
        Command::Status => run_status(&config, daemon_client().await).await,
    }
}

/// Connects to a running daemon, or `None` to act on the config directly.
async fn daemon_client() -> Option<WallpaperClient> {
    match WallpaperClient::connect_running().await {
        Ok(Some(client)) => Some(client),
        Ok(None) => {
            debug!("no daemon running, using the config file directly");
            None
        }
        Err(e) => {
            debug!(error = %e, "session bus unavailable, using the config file directly");
            None
        }
    }
}

fn non_empty(url: Option<String>) -> Option<String> {
    url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty())
}

async fn run_update(
    config: &Arc<ConfigStore>,
    client: Option<WallpaperClient>,
    url: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let url = non_empty(url);

    if let Some(client) = client {
        let message = client.update_now(url.as_deref().unwrap_or_default()).await?;
        println!("{message}");
        return Ok(());
    }

    if let Some(url) = &url {
        config.set_wallpaper_url(url)?;
    }

    // No daemon: run the same pipeline in-process. Interactive runs never
    // touch the alarm, so its receiver is not needed.
    let (alarm, _fired_rx) = TokioAlarm::new(Handle::current());
    let orchestrator = UpdateOrchestrator::new(
        config.clone(),
        WallpaperFetcher::new(Arc::new(ReqwestClient::new()), Arc::new(DesktopSetter::with_default_dir())),
        Arc::new(Scheduler::new(Arc::new(alarm))),
        Arc::new(DesktopNotifier::connect().await),
        StatusBoard::default(),
    );

    match orchestrator.run_once(Trigger::Interactive).await? {
        FetchOutcome::Success => {
            println!("{STATUS_UPDATED}");
            Ok(())
        }
        FetchOutcome::Failure(e) => Err(format!("{STATUS_FAILED}: {e}").into()),
        FetchOutcome::Skipped(SkipReason::EmptyUrl) => Err(STATUS_ENTER_URL.into()),
        FetchOutcome::Skipped(SkipReason::Superseded) => Ok(()),
    }
}

async fn run_url(
    config: &ConfigStore,
    client: Option<WallpaperClient>,
    url: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let Some(url) = url else {
        let current = match client {
            Some(client) => client.get_url().await?,
            None => config.wallpaper_url()?,
        };
        println!("{current}");
        return Ok(());
    };

    let url = non_empty(Some(url)).ok_or(STATUS_ENTER_URL)?;
    match client {
        Some(client) => client.set_url(&url).await?,
        None => config.set_wallpaper_url(&url)?,
    }
    println!("Wallpaper URL set to {url}");
    Ok(())
}

async fn run_schedule(
    config: &ConfigStore,
    client: Option<WallpaperClient>,
    time: Option<ScheduleTime>,
    disable: bool,
) -> Result<(), Box<dyn Error>> {
    if disable {
        match client {
            Some(client) => client.disable_schedule().await?,
            None => config.disable_schedule()?,
        }
        println!("Daily wallpaper update disabled");
        return Ok(());
    }

    match (time, client) {
        (Some(time), Some(client)) => {
            let info = client.set_schedule(time.hour(), time.minute()).await?;
            println!("Wallpaper will update daily at {}", time.format_12h());
            if !info.next_run.is_empty() {
                println!("Next run: {}", info.next_run);
            }
        }
        (Some(time), None) => {
            config.set_schedule(time)?;
            println!("Wallpaper will update daily at {}", time.format_12h());
            warn!("no daemon running, the schedule takes effect when `pixelpull daemon` starts");
        }
        (None, client) => {
            let schedule = config.schedule()?;
            let next_run = match client {
                Some(client) => client.get_schedule().await?.next_run,
                None => String::new(),
            };
            print_schedule(&schedule, &next_run);
        }
    }
    Ok(())
}

fn print_schedule(schedule: &ScheduleConfig, next_run: &str) {
    match schedule.active_time() {
        Some(time) => {
            println!("Daily update at {}", time.format_12h());
            if next_run.is_empty() {
                println!("Next run: not armed (daemon not running)");
            } else {
                println!("Next run: {next_run}");
            }
        }
        None => println!("Daily update disabled"),
    }
}

async fn run_target(
    config: &ConfigStore,
    client: Option<WallpaperClient>,
    target: Option<WallpaperTarget>,
) -> Result<(), Box<dyn Error>> {
    match (target, client) {
        (Some(target), Some(client)) => client.set_target(target.as_str()).await?,
        (Some(target), None) => config.set_wallpaper_target(target)?,
        (None, Some(client)) => println!("{}", client.get_target().await?),
        (None, None) => println!("{}", config.wallpaper_target()?),
    }
    if let Some(target) = target {
        println!("Wallpaper target set to {target}");
    }
    Ok(())
}

fn run_notify(config: &ConfigStore, enabled: Option<bool>) -> Result<(), Box<dyn Error>> {
    match enabled {
        Some(enabled) => {
            config.set_notify_on_success(enabled)?;
            println!("Success notifications {}", if enabled { "on" } else { "off" });
        }
        None => println!("{}", if config.notify_on_success()? { "on" } else { "off" }),
    }
    Ok(())
}

async fn run_status(config: &ConfigStore, client: Option<WallpaperClient>) -> Result<(), Box<dyn Error>> {
    println!("URL:     {}", config.wallpaper_url()?);
    println!("Target:  {}", config.wallpaper_target()?);

    let schedule = config.schedule()?;
    let (next_run, status) = match &client {
        Some(client) => (client.get_schedule().await?.next_run, client.get_status().await?),
        None => (String::new(), String::new()),
    };
    print_schedule(&schedule, &next_run);

    println!("Daemon:  {}", if client.is_some() { "running" } else { "not running" });
    if !status.is_empty() {
        println!("Status:  {status}");
    }
    println!("Config:  {}", config.path().display());
    Ok(())
}
