//! # Saffron
//!
//! A headless, multi-tenant personalization backend. Saffron translates a
//! small HTTP surface into calls against managed AWS services: S3 for
//! datasets, DynamoDB for the recommendation cache / user profiles /
//! campaign tracking, Personalize for recommendations, Pinpoint for
//! messaging and Step Functions for the training workflow.
//!
//! All tenant isolation happens in the adapters: object keys are prefixed
//! with the tenant id, Personalize resources use derived per-tenant names
//! and DynamoDB rows are keyed by tenant id.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `APP_NAME` | Application identifier | `SAFFRON` |
//! | `APP_VERSION` | Version string | `DEVELOPMENT-SNAPSHOT-VERSION` |
//! | `CLUSTER_ID` | Cluster/service identifier | `local` |
//! | `TASK_ID` | Task/instance identifier | `local` |
//! | `BIND_ADDRESS` | HTTP server bind address | (required) |
//! | `RUST_LOG` | Console log filter | `info` |
//!
//! Service configuration (bucket, tables, resource prefixes, the API key)
//! is read by [`config::Settings::from_env`].

use std::env;
use std::sync::LazyLock;
use tokio::signal::ctrl_c;
use tokio::signal::unix::{SignalKind, signal};

pub mod aws;
pub mod config;
pub mod logging;
pub mod tools;
pub mod web;

pub static APP_NAME: LazyLock<String> =
    LazyLock::new(|| env::var("APP_NAME").unwrap_or("SAFFRON".to_string()));

pub static APP_VERSION: LazyLock<String> =
    LazyLock::new(|| env::var("APP_VERSION").unwrap_or("DEVELOPMENT-SNAPSHOT-VERSION".to_string()));

pub static CLUSTER_ID: LazyLock<String> =
    LazyLock::new(|| env::var("CLUSTER_ID").unwrap_or("local".to_string()));

pub static TASK_ID: LazyLock<String> =
    LazyLock::new(|| env::var("TASK_ID").unwrap_or("local".to_string()));

pub async fn await_termination(purpose: &str) {
    let ctrl_c = ctrl_c();
    if let Ok(mut sig_term) = signal(SignalKind::terminate()) {
        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received CTRL-C. Shutting down: '{}'...", purpose);
            },
            _ = sig_term.recv() => {
                tracing::info!("Received SIGTERM. Shutting down: '{}'...", purpose);
            }
        }
    } else {
        let _ = ctrl_c.await;
        tracing::info!("Received CTRL-C. Shutting down: '{}'...", purpose);
    }
}
