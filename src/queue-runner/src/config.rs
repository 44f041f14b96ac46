use std::{net::SocketAddr, sync::Arc};

use anyhow::Context as _;
use clap::Parser;

use db::models::BuildID;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Query the queue runner status
    #[clap(long)]
    pub status: bool,

    /// REST server bind
    #[clap(short, long, default_value = "[::1]:8080")]
    pub rest_bind: SocketAddr,

    /// Config path
    #[clap(short, long, default_value = "config.toml")]
    pub config_path: String,

    /// Process exactly this build, then exit (testing only)
    #[clap(long)]
    pub build_one: Option<BuildID>,
}

impl Default for Cli {
    fn default() -> Self {
        Self::new()
    }
}

impl Cli {
    #[must_use]
    pub fn new() -> Self {
        Self::parse()
    }
}

fn default_data_dir() -> std::path::PathBuf {
    "/var/lib/forge".into()
}

fn default_store_dir() -> std::path::PathBuf {
    "/var/lib/forge/store".into()
}

fn default_machines_file() -> std::path::PathBuf {
    "/etc/forge/machines".into()
}

fn default_pg_socket_url() -> secrecy::SecretString {
    "postgres://forge@%2Frun%2Fpostgresql:5432/forge".into()
}

const fn default_max_db_connections() -> u32 {
    128
}

const fn default_machines_poll_interval_in_s() -> u64 {
    30
}

const fn default_dispatch_trigger_timer_in_s() -> i64 {
    120
}

const fn default_queue_trigger_timer_in_s() -> i64 {
    -1
}

const fn default_max_tries() -> u32 {
    5
}

const fn default_retry_interval() -> u32 {
    60
}

const fn default_retry_backoff() -> f32 {
    3.0
}

const fn default_max_machine_disable_in_s() -> i64 {
    600
}

const fn default_stop_queue_run_after_in_s() -> i64 {
    60
}

const fn default_max_log_size() -> u64 {
    64 * 1024 * 1024
}

/// Main configuration of the application
#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
struct AppConfig {
    #[serde(default = "default_data_dir")]
    data_dir: std::path::PathBuf,

    #[serde(default = "default_store_dir")]
    store_dir: std::path::PathBuf,

    #[serde(default = "default_machines_file")]
    machines_file: std::path::PathBuf,

    #[serde(default = "default_machines_poll_interval_in_s")]
    machines_poll_interval_in_s: u64,

    #[serde(default = "default_pg_socket_url")]
    db_url: secrecy::SecretString,

    #[serde(default = "default_max_db_connections")]
    max_db_connections: u32,

    // setting this to -1, will disable the timer
    #[serde(default = "default_dispatch_trigger_timer_in_s")]
    dispatch_trigger_timer_in_s: i64,

    // setting this to -1, will disable the timer
    #[serde(default = "default_queue_trigger_timer_in_s")]
    queue_trigger_timer_in_s: i64,

    #[serde(default = "default_max_tries")]
    max_retries: u32,

    #[serde(default = "default_retry_interval")]
    retry_interval: u32,

    #[serde(default = "default_retry_backoff")]
    retry_backoff: f32,

    #[serde(default = "default_max_machine_disable_in_s")]
    max_machine_disable_in_s: i64,

    #[serde(default = "default_stop_queue_run_after_in_s")]
    stop_queue_run_after_in_s: i64,

    #[serde(default = "default_max_log_size")]
    max_log_size: u64,
}

/// Prepared configuration of the application
#[derive(Debug)]
pub struct PreparedApp {
    #[allow(dead_code)]
    data_dir: std::path::PathBuf,
    log_dir: std::path::PathBuf,
    store_dir: std::path::PathBuf,
    machines_file: std::path::PathBuf,
    machines_poll_interval: std::time::Duration,
    pub db_url: secrecy::SecretString,
    max_db_connections: u32,
    dispatch_trigger_timer: Option<tokio::time::Duration>,
    queue_trigger_timer: Option<tokio::time::Duration>,
    max_retries: u32,
    retry_interval: f32,
    retry_backoff: f32,
    max_machine_disable: jiff::SignedDuration,
    stop_queue_run_after: Option<jiff::SignedDuration>,
    max_log_size: u64,
}

impl TryFrom<AppConfig> for PreparedApp {
    type Error = anyhow::Error;

    fn try_from(val: AppConfig) -> Result<Self, Self::Error> {
        let log_dir = val.data_dir.join("build-logs");

        Ok(Self {
            log_dir,
            store_dir: val.store_dir,
            machines_file: val.machines_file,
            machines_poll_interval: std::time::Duration::from_secs(
                val.machines_poll_interval_in_s.max(1),
            ),
            data_dir: val.data_dir,
            db_url: val.db_url,
            max_db_connections: val.max_db_connections,
            dispatch_trigger_timer: u64::try_from(val.dispatch_trigger_timer_in_s)
                .ok()
                .and_then(|v| {
                    if v == 0 {
                        None
                    } else {
                        Some(tokio::time::Duration::from_secs(v))
                    }
                }),
            queue_trigger_timer: u64::try_from(val.queue_trigger_timer_in_s)
                .ok()
                .and_then(|v| {
                    if v == 0 {
                        None
                    } else {
                        Some(tokio::time::Duration::from_secs(v))
                    }
                }),
            max_retries: val.max_retries,
            #[allow(clippy::cast_precision_loss)]
            retry_interval: val.retry_interval as f32,
            retry_backoff: val.retry_backoff,
            max_machine_disable: jiff::SignedDuration::from_secs(val.max_machine_disable_in_s),
            stop_queue_run_after: if val.stop_queue_run_after_in_s <= 0 {
                None
            } else {
                Some(jiff::SignedDuration::from_secs(
                    val.stop_queue_run_after_in_s,
                ))
            },
            max_log_size: val.max_log_size,
        })
    }
}

/// Loads the config from specified path
#[tracing::instrument(err)]
fn load_config(filepath: &str) -> anyhow::Result<PreparedApp> {
    tracing::info!("Trying to loading file: {filepath}");
    let toml: AppConfig = if let Ok(content) = fs_err::read_to_string(filepath) {
        toml::from_str(&content)
            .with_context(|| format!("Failed to toml load from '{filepath}'"))?
    } else {
        tracing::warn!("no config file found! Using default config");
        toml::from_str("").context("Failed to parse empty string as config")?
    };
    tracing::info!("Loaded config: {toml:?}");

    toml.try_into().context("Failed to prepare configuration")
}

#[derive(Debug, Clone)]
pub struct App {
    inner: Arc<arc_swap::ArcSwap<PreparedApp>>,
}

impl App {
    #[tracing::instrument(err)]
    pub fn init(filepath: &str) -> anyhow::Result<Self> {
        Ok(Self {
            inner: Arc::new(arc_swap::ArcSwap::from(Arc::new(load_config(filepath)?))),
        })
    }

    fn swap_inner(&self, new_val: PreparedApp) {
        self.inner.store(Arc::new(new_val));
    }

    #[must_use]
    pub fn get_log_dir(&self) -> std::path::PathBuf {
        let inner = self.inner.load();
        inner.log_dir.clone()
    }

    #[must_use]
    pub fn get_store_dir(&self) -> std::path::PathBuf {
        let inner = self.inner.load();
        inner.store_dir.clone()
    }

    #[must_use]
    pub fn get_machines_file(&self) -> std::path::PathBuf {
        let inner = self.inner.load();
        inner.machines_file.clone()
    }

    #[must_use]
    pub fn get_machines_poll_interval(&self) -> std::time::Duration {
        let inner = self.inner.load();
        inner.machines_poll_interval
    }

    #[must_use]
    pub fn get_db_url(&self) -> secrecy::SecretString {
        let inner = self.inner.load();
        inner.db_url.clone()
    }

    #[must_use]
    pub fn get_max_db_connections(&self) -> u32 {
        let inner = self.inner.load();
        inner.max_db_connections
    }

    #[must_use]
    pub fn get_dispatch_trigger_timer(&self) -> Option<tokio::time::Duration> {
        let inner = self.inner.load();
        inner.dispatch_trigger_timer
    }

    #[must_use]
    pub fn get_queue_trigger_timer(&self) -> Option<tokio::time::Duration> {
        let inner = self.inner.load();
        inner.queue_trigger_timer
    }

    #[must_use]
    pub fn get_retry(&self) -> (u32, f32, f32) {
        let inner = self.inner.load();
        (inner.max_retries, inner.retry_interval, inner.retry_backoff)
    }

    #[must_use]
    pub fn get_max_machine_disable(&self) -> jiff::SignedDuration {
        let inner = self.inner.load();
        inner.max_machine_disable
    }

    #[must_use]
    pub fn get_stop_queue_run_after(&self) -> Option<jiff::SignedDuration> {
        let inner = self.inner.load();
        inner.stop_queue_run_after
    }

    #[must_use]
    pub fn get_max_log_size(&self) -> u64 {
        let inner = self.inner.load();
        inner.max_log_size
    }
}

pub fn reload(current_config: &App, filepath: &str, state: &Arc<crate::state::State>) {
    let new_config = match load_config(filepath) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("Failed to load new config: {e}");
            let _notify = sd_notify::notify(
                false,
                &[
                    sd_notify::NotifyState::Status("Reload failed"),
                    sd_notify::NotifyState::Errno(1),
                ],
            );

            return;
        }
    };

    if let Err(e) = state.reload_config_callback(&new_config) {
        tracing::error!("Config reload failed with {e}");
        let _notify = sd_notify::notify(
            false,
            &[
                sd_notify::NotifyState::Status("Configuration reloaded failed - Running"),
                sd_notify::NotifyState::Errno(1),
            ],
        );
        return;
    }

    current_config.swap_inner(new_config);
    let _notify = sd_notify::notify(
        false,
        &[
            sd_notify::NotifyState::Status("Configuration reloaded - Running"),
            sd_notify::NotifyState::Ready,
        ],
    );
}
