//! Prometheus metrics for the stream store.
//!
//! The store records counters and gauges through the `metrics` facade unconditionally;
//! they are no-ops until a recorder is installed. [`install_recorder`] installs a
//! Prometheus recorder once per process and [`serve_metrics`] exposes it over HTTP.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::task::JoinHandle;

use crate::retention::Removed;

/// Committed user appends.
pub const APPENDS_TOTAL: &str = "streamstore_appends_total";
/// Messages written by committed user appends.
pub const MESSAGES_APPENDED_TOTAL: &str = "streamstore_messages_appended_total";
/// Writes rejected by the expected-version check.
pub const CONFLICTS_TOTAL: &str = "streamstore_conflicts_total";
/// Messages removed by deletion, truncation or expiry.
pub const MESSAGES_DELETED_TOTAL: &str = "streamstore_messages_deleted_total";
/// Streams removed, metadata streams included.
pub const STREAMS_DELETED_TOTAL: &str = "streamstore_streams_deleted_total";
/// Paged reads, labelled by `op`.
pub const READS_TOTAL: &str = "streamstore_reads_total";
/// Highest live checkpoint, `-1` when the store is empty.
pub const HEAD_CHECKPOINT: &str = "streamstore_head_checkpoint";
/// Subscription streams currently open.
pub const SUBSCRIPTIONS_ACTIVE: &str = "streamstore_subscriptions_active";

/// Error type for metrics installation.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The global metrics recorder has already been installed.
    #[error("metrics recorder already installed")]
    AlreadyInstalled,

    /// Some other recorder was installed as the global recorder first.
    #[error("a different global metrics recorder is already installed")]
    ForeignRecorder,
}

/// Cheaply cloneable handle to the installed Prometheus recorder.
#[derive(Clone, Debug)]
pub struct MetricsHandle {
    inner: Arc<PrometheusHandle>,
}

impl MetricsHandle {
    /// Render the current snapshot in Prometheus exposition format.
    pub fn render(&self) -> String {
        self.inner.render()
    }
}

static RECORDER_HANDLE: std::sync::OnceLock<MetricsHandle> = std::sync::OnceLock::new();

/// Install the global Prometheus metrics recorder.
///
/// # Errors
///
/// Returns [`MetricsError::AlreadyInstalled`] on every call after the first, and
/// [`MetricsError::ForeignRecorder`] if another recorder owns the global slot.
pub fn install_recorder() -> Result<MetricsHandle, MetricsError> {
    let mut outcome = Err(MetricsError::AlreadyInstalled);
    let handle = RECORDER_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = MetricsHandle {
            inner: Arc::new(recorder.handle()),
        };
        outcome = ::metrics::set_global_recorder(recorder)
            .map(|()| handle.clone())
            .map_err(|_| MetricsError::ForeignRecorder);
        handle
    });
    outcome.map(|_| handle.clone())
}

/// Returns the previously installed [`MetricsHandle`], if any.
pub fn get_installed_handle() -> Option<MetricsHandle> {
    RECORDER_HANDLE.get().cloned()
}

fn metrics_router(handle: MetricsHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let h = handle.clone();
            async move {
                let body = h.render();
                (
                    [(
                        axum::http::header::CONTENT_TYPE,
                        "text/plain; version=0.0.4",
                    )],
                    body,
                )
            }
        }),
    )
}

/// Spawn an axum HTTP server that serves `GET /metrics` on `addr`.
///
/// Bind failures are logged and end the task.
pub fn serve_metrics(handle: MetricsHandle, addr: SocketAddr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(addr = %addr, error = %e, "Failed to bind metrics listener");
                return;
            }
        };
        run_server(handle, listener).await;
    })
}

/// Spawn the metrics server on an already-bound listener.
pub fn serve_metrics_on_listener(
    handle: MetricsHandle,
    listener: tokio::net::TcpListener,
) -> JoinHandle<()> {
    tokio::spawn(run_server(handle, listener))
}

async fn run_server(handle: MetricsHandle, listener: tokio::net::TcpListener) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "Metrics server listening");
    }
    if let Err(e) = axum::serve(listener, metrics_router(handle)).await {
        tracing::error!(error = %e, "Metrics server error");
    }
}

pub(crate) fn record_append(count: usize) {
    counter!(APPENDS_TOTAL).increment(1);
    counter!(MESSAGES_APPENDED_TOTAL).increment(count as u64);
}

pub(crate) fn record_conflict() {
    counter!(CONFLICTS_TOTAL).increment(1);
}

pub(crate) fn record_removed(removed: Removed) {
    if removed.messages > 0 {
        counter!(MESSAGES_DELETED_TOTAL).increment(removed.messages as u64);
    }
    if removed.streams > 0 {
        counter!(STREAMS_DELETED_TOTAL).increment(removed.streams as u64);
    }
}

pub(crate) fn record_read(op: &'static str) {
    counter!(READS_TOTAL, "op" => op).increment(1);
}

pub(crate) fn set_head_checkpoint(head: Option<u64>) {
    gauge!(HEAD_CHECKPOINT).set(head.map_or(-1.0, |h| h as f64));
}

/// RAII guard for the active subscriptions gauge.
///
/// Held by every subscription stream, so the gauge goes down however the stream ends.
pub(crate) struct SubscriptionGauge;

impl SubscriptionGauge {
    pub(crate) fn new() -> Self {
        gauge!(SUBSCRIPTIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Drop for SubscriptionGauge {
    fn drop(&mut self) {
        gauge!(SUBSCRIPTIONS_ACTIVE).decrement(1.0);
    }
}
