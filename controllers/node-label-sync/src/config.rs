//! Controller configuration.
//!
//! All settings come from environment variables:
//! - `SYNC_LABELS` (required): comma-separated label keys, in sync order
//! - `WORKERS`: worker tasks per resource kind (default 2)
//! - `RESYNC_PERIOD_SECS`: periodic re-enqueue of every cached object, `0` disables (default 30)
//! - `KUBE_MASTER_URL`: overrides the API server address from kubeconfig / in-cluster config
//! - `METRICS_ADDR`: listen address of the metrics and health server (default `0.0.0.0:8080`)
//!
//! `KUBECONFIG` is honored by the Kubernetes client itself.

use crate::error::ControllerError;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_WORKERS: usize = 2;
const DEFAULT_RESYNC_PERIOD_SECS: u64 = 30;
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";

/// Runtime configuration of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Label keys copied from nodes to pods, in configured order
    pub labels: Vec<String>,
    /// Worker tasks per resource kind
    pub workers: usize,
    /// Period of the full re-enqueue, `None` when disabled
    pub resync_period: Option<Duration>,
    /// API server address override
    pub master_url: Option<String>,
    /// Metrics and health server address
    pub metrics_addr: SocketAddr,
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_labels = lookup("SYNC_LABELS").ok_or_else(|| {
            ControllerError::InvalidConfig("SYNC_LABELS environment variable is required".to_string())
        })?;
        let labels = parse_labels(&raw_labels);
        if labels.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "SYNC_LABELS must name at least one label key".to_string(),
            ));
        }

        let workers = match lookup("WORKERS") {
            Some(raw) => parse_number::<usize>("WORKERS", &raw)?,
            None => DEFAULT_WORKERS,
        };
        if workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "WORKERS must be at least 1".to_string(),
            ));
        }

        let resync_secs = match lookup("RESYNC_PERIOD_SECS") {
            Some(raw) => parse_number::<u64>("RESYNC_PERIOD_SECS", &raw)?,
            None => DEFAULT_RESYNC_PERIOD_SECS,
        };
        let resync_period = (resync_secs > 0).then(|| Duration::from_secs(resync_secs));

        let master_url = lookup("KUBE_MASTER_URL")
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        let raw_addr = lookup("METRICS_ADDR").unwrap_or_else(|| DEFAULT_METRICS_ADDR.to_string());
        let metrics_addr = raw_addr.trim().parse::<SocketAddr>().map_err(|e| {
            ControllerError::InvalidConfig(format!("METRICS_ADDR `{raw_addr}` is not a socket address: {e}"))
        })?;

        Ok(Self {
            labels,
            workers,
            resync_period,
            master_url,
            metrics_addr,
        })
    }
}

/// Splits a comma-separated label list, dropping blanks and repeated keys
/// while keeping the first occurrence's position.
pub fn parse_labels(raw: &str) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for label in raw.split(',').map(str::trim).filter(|l| !l.is_empty()) {
        if !labels.iter().any(|existing| existing == label) {
            labels.push(label.to_string());
        }
    }
    labels
}

fn parse_number<T>(name: &str, raw: &str) -> Result<T, ControllerError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ControllerError::InvalidConfig(format!("{name} `{raw}` is not a valid number: {e}")))
}
