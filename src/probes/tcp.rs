//! TCP connect probe over an ordered list of candidate ports

use std::future::Future;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::{CheckResult, Protocol, Status};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Attempt {
    Connected { latency_ms: u64 },
    Refused,
    TimedOut,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn attempt(&self, host: &str, port: u16) -> Attempt {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
            Err(_) => Attempt::TimedOut,
            Ok(Ok(stream)) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                drop(stream);
                Attempt::Connected { latency_ms }
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => Attempt::Refused,
            Ok(Err(e)) => Attempt::Failed(e.to_string()),
        }
    }

    /// Try each port in order.
    ///
    /// The first successful connect wins. A refusal proves the host is up, so
    /// it is remembered but the remaining ports are still tried. Only a timeout
    /// is retried, once, on the same port. Failure outcomes are attributed to
    /// the first candidate port.
    pub async fn check(&self, host: &str, ports: &[u16]) -> CheckResult {
        self.check_with(host, ports, move |port| self.attempt(host, port))
            .await
    }

    async fn check_with<F, Fut>(&self, host: &str, ports: &[u16], mut attempt: F) -> CheckResult
    where
        F: FnMut(u16) -> Fut,
        Fut: Future<Output = Attempt>,
    {
        let Some(&first_port) = ports.first() else {
            return CheckResult::new(Protocol::Tcp, Status::Degraded)
                .with_error("no tcp ports configured");
        };

        let mut refused = false;
        let mut last_error = None;

        for &port in ports {
            let mut outcome = attempt(port).await;
            if outcome == Attempt::TimedOut {
                debug!("{host}:{port} timed out after {:?}, retrying once", self.timeout);
                outcome = attempt(port).await;
            }
            trace!("{host}:{port} -> {outcome:?}");

            match outcome {
                Attempt::Connected { latency_ms } => {
                    return CheckResult::new(Protocol::Tcp, Status::Up)
                        .with_latency(latency_ms)
                        .with_port(port);
                }
                Attempt::Refused => refused = true,
                Attempt::TimedOut => last_error = Some("tcp timeout".to_string()),
                Attempt::Failed(e) => last_error = Some(format!("tcp error: {e}")),
            }
        }

        if refused {
            CheckResult::new(Protocol::Tcp, Status::Degraded)
                .with_error("tcp refused")
                .with_port(first_port)
        } else {
            CheckResult::new(Protocol::Tcp, Status::Down)
                .with_error(last_error.unwrap_or_else(|| "tcp timeout".to_string()))
                .with_port(first_port)
        }
    }
}
