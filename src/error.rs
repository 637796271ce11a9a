//! Error types shared by probes, collectors and the scheduler
//!
//! Probes and collectors never let an error escape past their own boundary
//! as a panic or an untyped string: every failure is a [`CheckError`] with an
//! explicit [`ErrorKind`], and rate limits always carry the [`Endpoint`] that
//! produced them. The scheduler routes on these fields only.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Status;

/// Vendor API endpoint a collector call was made against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endpoint {
    Status,
    Perf,
    Iface,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Status => write!(f, "status"),
            Endpoint::Perf => write!(f, "perf"),
            Endpoint::Iface => write!(f, "iface"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    /// Host answered but refused; reachable, so degraded rather than down
    ConnectionRefused,
    RateLimited,
    /// Missing token, base URL or similar agent-side problem
    Configuration,
    Transport,
}

impl ErrorKind {
    /// Surface status a failure of this kind maps to
    pub fn status(self) -> Status {
        match self {
            ErrorKind::ConnectionRefused | ErrorKind::RateLimited | ErrorKind::Configuration => {
                Status::Degraded
            }
            ErrorKind::Timeout | ErrorKind::Transport => Status::Down,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct CheckError {
    pub kind: ErrorKind,
    pub endpoint: Option<Endpoint>,
    pub message: String,
}

impl CheckError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: None,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionRefused, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn rate_limited(endpoint: Endpoint) -> Self {
        Self {
            kind: ErrorKind::RateLimited,
            endpoint: Some(endpoint),
            message: format!("{endpoint} endpoint rate limited"),
        }
    }

    pub fn at(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == ErrorKind::RateLimited
    }

    /// Map an HTTP client error onto the taxonomy
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::timeout(format!("request timed out: {err}"));
        }
        if err.is_connect() && caused_by_refusal(err) {
            return Self::refused(format!("connection refused: {err}"));
        }
        if err.is_builder() {
            return Self::configuration(format!("invalid request: {err}"));
        }
        Self::transport(err.to_string())
    }
}

fn caused_by_refusal(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(source) = current {
        if let Some(io) = source.downcast_ref::<std::io::Error>() {
            return io.kind() == std::io::ErrorKind::ConnectionRefused;
        }
        current = source.source();
    }
    false
}
