//! ICMP probe via the platform `ping` binary
//!
//! A single echo is sent with the platform's own timeout flag. The child is
//! raced against `timeout + KILL_GRACE`; if the race is lost the process is
//! killed before returning, and `kill_on_drop` covers every other exit path.

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::{CheckResult, Protocol, Status};

/// Slack on top of the ping timeout before the process is force-killed
pub const KILL_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpOutcome {
    pub ok: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl IcmpOutcome {
    fn reachable(latency_ms: Option<u64>) -> Self {
        Self {
            ok: true,
            latency_ms,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            latency_ms: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IcmpProbe {
    program: String,
    /// May contain `{host}`, `{timeout_secs}` and `{timeout_ms}` placeholders
    args: Vec<String>,
    timeout: Duration,
}

impl IcmpProbe {
    /// Probe using the platform `ping`
    pub fn new(timeout: Duration) -> Self {
        let args: &[&str] = if cfg!(target_os = "windows") {
            &["-n", "1", "-w", "{timeout_ms}", "{host}"]
        } else if cfg!(target_os = "macos") {
            &["-c", "1", "-W", "{timeout_ms}", "{host}"]
        } else {
            &["-c", "1", "-W", "{timeout_secs}", "{host}"]
        };
        Self::with_command("ping", args.iter().map(|a| a.to_string()).collect(), timeout)
    }

    /// Probe using an arbitrary ping-like command
    pub fn with_command(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    fn render_args(&self, host: &str) -> Vec<String> {
        let timeout_secs = self.timeout.as_secs().max(1).to_string();
        let timeout_ms = self.timeout.as_millis().max(1).to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{host}", host)
                    .replace("{timeout_secs}", &timeout_secs)
                    .replace("{timeout_ms}", &timeout_ms)
            })
            .collect()
    }

    pub async fn ping(&self, host: &str) -> IcmpOutcome {
        let mut child = match Command::new(&self.program)
            .args(self.render_args(host))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!("could not spawn {}: {e}", self.program);
                return IcmpOutcome::failed(format!("icmp spawn failed: {e}"));
            }
        };

        let started = Instant::now();
        let mut stdout = child.stdout.take();
        let raced = {
            let run = async {
                let mut output = String::new();
                if let Some(pipe) = stdout.as_mut() {
                    pipe.read_to_string(&mut output).await?;
                }
                let status = child.wait().await?;
                Ok::<_, std::io::Error>((status, output))
            };
            tokio::time::timeout(self.timeout + KILL_GRACE, run).await
        };

        match raced {
            Err(_) => {
                debug!("ping to {host} exceeded {:?}, killing", self.timeout + KILL_GRACE);
                if let Err(e) = child.kill().await {
                    warn!("failed to kill ping process: {e}");
                }
                IcmpOutcome::failed("icmp timeout")
            }
            Ok(Err(e)) => IcmpOutcome::failed(format!("icmp failed: {e}")),
            Ok(Ok((status, output))) => {
                trace!("ping output after {:?}: {output}", started.elapsed());
                if status.success() {
                    IcmpOutcome::reachable(parse_round_trip(&output))
                } else {
                    IcmpOutcome::failed("icmp unreachable")
                }
            }
        }
    }

    pub async fn check(&self, host: &str) -> CheckResult {
        let outcome = self.ping(host).await;
        let mut result = CheckResult::new(
            Protocol::Icmp,
            if outcome.ok { Status::Up } else { Status::Down },
        );
        result.latency_ms = outcome.latency_ms;
        result.error = outcome.error;
        result
    }
}

/// Extract the round-trip time in whole milliseconds from ping output.
///
/// Understands the per-reply `time=12.3 ms` form (Linux, macOS, Windows),
/// the Windows `time<1ms` form, which is reported as 1 ms, and the summary
/// `min/avg/max` line as a fallback.
pub fn parse_round_trip(output: &str) -> Option<u64> {
    static REPLY: OnceLock<Regex> = OnceLock::new();
    static SUMMARY: OnceLock<Regex> = OnceLock::new();

    let reply = REPLY.get_or_init(|| {
        Regex::new(r"(?i)time\s*(?P<op>[=<])\s*(?P<val>[0-9]+(?:[.,][0-9]+)?)\s*ms")
            .expect("static regex")
    });

    if let Some(caps) = reply.captures(output) {
        let value: f64 = caps["val"].replace(',', ".").parse().ok()?;
        if &caps["op"] == "<" {
            return Some((value.ceil() as u64).max(1));
        }
        return Some(value.round() as u64);
    }

    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"min/avg/max(?:/\w+)?\s*=\s*[0-9.]+/(?P<avg>[0-9.]+)/").expect("static regex")
    });

    summary
        .captures(output)
        .and_then(|caps| caps["avg"].parse::<f64>().ok())
        .map(|avg| avg.round() as u64)
}
