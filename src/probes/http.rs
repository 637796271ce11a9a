//! HTTP probe: one request, status code compared against an expected value

use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, trace};

use crate::error::CheckError;
use crate::tasks::HttpMethod;
use crate::{CheckResult, Protocol, Status};

#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            // a redirect to a login page is "reachable but not as expected"
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(true)
            .build()
            .context("failed to build HTTP probe client")?;

        Ok(Self { client, timeout })
    }

    pub async fn check(&self, url: &str, method: HttpMethod, expected_status: u16) -> CheckResult {
        trace!("checking {url}");

        let method = match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
        };

        let started = Instant::now();
        let request = self.client.request(method, url).send();

        // reqwest enforces the timeout as well; the outer race bounds DNS and
        // connection setup the same way
        let response = match tokio::time::timeout(self.timeout, request).await {
            Err(_) => {
                return CheckResult::new(Protocol::Http, Status::Down).with_error("http timeout");
            }
            Ok(Err(e)) => {
                let err = CheckError::from_reqwest(&e);
                debug!("request to {url} failed: {err}");
                return CheckResult::new(Protocol::Http, Status::Down).with_error(err.to_string());
            }
            Ok(Ok(response)) => response,
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        let status_code = response.status().as_u16();

        let mut result = if status_code == expected_status {
            CheckResult::new(Protocol::Http, Status::Up)
        } else {
            CheckResult::new(Protocol::Http, Status::Degraded).with_error(format!(
                "unexpected status {status_code} (expected {expected_status})"
            ))
        };
        result.latency_ms = Some(latency_ms);
        result.status_code = Some(status_code);
        result
    }
}
