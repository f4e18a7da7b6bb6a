//! Remote control-plane servers and their health state

use chrono::{DateTime, Utc};
use hyper::Uri;
use std::sync::Mutex;

use crate::{HubError, Result};

/// Health bookkeeping for one remote server
#[derive(Clone, Debug, PartialEq)]
pub struct HealthState {
    pub healthy: bool,
    pub consecutive_successes: u32,
    pub healthy_threshold: u32,
    pub last_probe: Option<DateTime<Utc>>,
}

/// One control-plane API endpoint the hub may connect to
///
/// Created from static configuration; only the health checker mutates the
/// health state.
#[derive(Debug)]
pub struct RemoteServer {
    url: Uri,
    address: String,
    state: Mutex<HealthState>,
}

impl RemoteServer {
    pub fn new(url: &str, healthy_threshold: u32) -> Result<Self> {
        let parsed: Uri = url.parse().map_err(|e: hyper::http::uri::InvalidUri| HubError::InvalidServer {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let scheme = parsed.scheme_str().ok_or_else(|| HubError::InvalidServer {
            url: url.to_string(),
            reason: "missing scheme".to_string(),
        })?;
        let authority = parsed.authority().ok_or_else(|| HubError::InvalidServer {
            url: url.to_string(),
            reason: "missing host".to_string(),
        })?;
        let port = authority
            .port_u16()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        let address = format!("{}:{}", authority.host(), port);

        Ok(Self {
            url: parsed,
            address,
            state: Mutex::new(HealthState {
                healthy: false,
                consecutive_successes: 0,
                healthy_threshold: healthy_threshold.max(1),
                last_probe: None,
            }),
        })
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// `host:port` of the server, used to key tracked connections
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Build the upstream URI for a request path and query
    pub fn join(&self, path_and_query: &str) -> Result<Uri> {
        let base = self.url.to_string();
        let base = base.trim_end_matches('/');
        format!("{}{}", base, path_and_query)
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| HubError::InvalidRequest(e.to_string()))
    }

    pub fn is_healthy(&self) -> bool {
        self.state.lock().map(|s| s.healthy).unwrap_or(false)
    }

    pub fn health(&self) -> HealthState {
        match self.state.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Mark healthy directly, bypassing the success threshold
    pub fn mark_healthy(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.healthy = true;
            state.consecutive_successes = state.healthy_threshold;
            state.last_probe = Some(Utc::now());
        }
    }

    /// Record a probe outcome; returns the new health when it changed
    ///
    /// A single failure flips the server unhealthy. Only `healthy_threshold`
    /// consecutive successes flip it back.
    pub fn record_probe(&self, success: bool) -> Option<bool> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.last_probe = Some(Utc::now());
        let before = state.healthy;

        if success {
            state.consecutive_successes = state.consecutive_successes.saturating_add(1);
            if !state.healthy && state.consecutive_successes >= state.healthy_threshold {
                state.healthy = true;
            }
        } else {
            state.consecutive_successes = 0;
            state.healthy = false;
        }

        (state.healthy != before).then_some(state.healthy)
    }
}
