//! Tracing setup.
//!
//! [`setup_tracing`] installs a console subscriber filtered via `RUST_LOG`
//! (default `info`). With the `pretty_logs` feature the output is colorized
//! for local development; without it, plain text suitable for CloudWatch.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

#[cfg(feature = "pretty_logs")]
mod pretty;

/// Initializes the tracing subscriber. Call once at startup.
///
/// # Panics
///
/// Panics if called more than once.
pub fn setup_tracing() {
    Registry::default().with(console_layer()).init();
    tracing::info!("Tracing initialized successfully [reporting to console]");
}

#[cfg(feature = "pretty_logs")]
fn console_layer() -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt::layer()
        .event_format(pretty::PrettyLogFormat)
        .with_filter(filter)
        .boxed()
}

#[cfg(not(feature = "pretty_logs"))]
fn console_layer() -> Box<dyn Layer<Registry> + Send + Sync + 'static> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_filter(filter)
        .boxed()
}
