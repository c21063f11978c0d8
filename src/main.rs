use std::net::SocketAddr;
use std::time::Duration;

use streamstore::config::{DEFAULT_CATCH_UP_PAGE_SIZE, DEFAULT_NOTIFICATION_CAPACITY};
use streamstore::metrics::{install_recorder, serve_metrics};
use streamstore::{StoreConfig, StreamStore};

/// Host configuration parsed from environment variables.
///
/// # Environment Variables
///
/// | Variable                          | Default | Description                              |
/// |-----------------------------------|---------|------------------------------------------|
/// | `STREAMSTORE_NOTIFY_CAPACITY`     | `1024`  | Append notification channel capacity     |
/// | `STREAMSTORE_CATCHUP_PAGE_SIZE`   | `500`   | Subscription catch-up page size          |
/// | `STREAMSTORE_SWEEP_INTERVAL_SECS` | `60`    | Max-age sweep interval, `0` disables it  |
/// | `STREAMSTORE_METRICS_LISTEN`      | --      | Socket address for `GET /metrics`        |
#[derive(Debug, Clone, PartialEq)]
struct Config {
    store: StoreConfig,
    /// `None` disables the max-age sweeper.
    sweep_interval: Option<Duration>,
    /// `None` disables the metrics endpoint.
    metrics_addr: Option<SocketAddr>,
}

const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

fn parse_var<T>(name: &str, default: T) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| format!("{name} is not valid: {e}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Parse host configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Err(String)` naming the variable if any value is set but malformed, or
    /// if a capacity or page size is zero.
    fn from_env() -> Result<Config, String> {
        let notification_capacity =
            parse_var("STREAMSTORE_NOTIFY_CAPACITY", DEFAULT_NOTIFICATION_CAPACITY)?;
        if notification_capacity == 0 {
            return Err("STREAMSTORE_NOTIFY_CAPACITY must be nonzero".to_string());
        }

        let catch_up_page_size =
            parse_var("STREAMSTORE_CATCHUP_PAGE_SIZE", DEFAULT_CATCH_UP_PAGE_SIZE)?;
        if catch_up_page_size == 0 {
            return Err("STREAMSTORE_CATCHUP_PAGE_SIZE must be nonzero".to_string());
        }

        let sweep_secs = parse_var("STREAMSTORE_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)?;
        let sweep_interval = (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs));

        let metrics_addr = match std::env::var("STREAMSTORE_METRICS_LISTEN") {
            Ok(val) => Some(val.parse::<SocketAddr>().map_err(|e| {
                format!("STREAMSTORE_METRICS_LISTEN is not a valid socket address: {e}")
            })?),
            Err(_) => None,
        };

        Ok(Config {
            store: StoreConfig {
                notification_capacity,
                catch_up_page_size,
            },
            sweep_interval,
            metrics_addr,
        })
    }
}

/// Initialize the global `tracing` subscriber with an `EnvFilter` from `RUST_LOG`,
/// defaulting to `info`. Repeated calls are a silent no-op.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Waits for SIGINT, plus SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to register SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(1);
        }
    };
    tracing::info!(
        notification_capacity = config.store.notification_capacity,
        catch_up_page_size = config.store.catch_up_page_size,
        "Store configuration"
    );

    let metrics_server = match config.metrics_addr {
        Some(addr) => match install_recorder() {
            Ok(handle) => Some(serve_metrics(handle, addr)),
            Err(e) => {
                tracing::error!(error = %e, "Failed to install metrics recorder");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let store = StreamStore::with_config(config.store);

    let sweeper = config.sweep_interval.map(|interval| {
        tracing::info!(interval_secs = interval.as_secs(), "Max-age sweeper enabled");
        store.spawn_expiry_sweeper(interval)
    });

    tracing::info!("Stream store ready");
    shutdown_signal().await;

    tracing::info!("Shutting down");
    store.dispose().await;
    if let Some(sweeper) = sweeper
        && let Err(e) = sweeper.await
    {
        tracing::error!(error = %e, "Sweeper task failed");
    }
    if let Some(server) = metrics_server {
        server.abort();
    }
}
