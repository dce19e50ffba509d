use crate::error::{NodeError, NodeResult};
use crate::telemetry::{SamplesRequest, TelemetrySample};
use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Receives each publish cycle's batch. Returns the number of samples accepted.
pub trait ForwardingSink: Send {
    fn forward(&self, samples: &[TelemetrySample]) -> NodeResult<usize>;
}

impl<F> ForwardingSink for F
where
    F: Fn(&[TelemetrySample]) -> NodeResult<usize> + Send,
{
    fn forward(&self, samples: &[TelemetrySample]) -> NodeResult<usize> {
        self(samples)
    }
}

#[derive(Debug, Deserialize)]
struct SamplesResponse {
    accepted: u64,
}

/// Posts batches to the local forwarder's ingest route.
#[derive(Debug, Clone)]
pub struct HttpForwardingSink {
    client: Client,
    endpoint: Url,
}

impl HttpForwardingSink {
    /// The ingest route is resolved below any path prefix on `forwarder_url`.
    pub fn new(forwarder_url: &Url, timeout: Duration) -> Result<Self> {
        let mut base = forwarder_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base.join("v1/samples").context("invalid forwarder url")?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build forwarding http client")?;
        Ok(Self { client, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl ForwardingSink for HttpForwardingSink {
    fn forward(&self, samples: &[TelemetrySample]) -> NodeResult<usize> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&SamplesRequest::new(samples))
            .send()
            .map_err(|err| NodeError::SinkUnavailable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(NodeError::SinkUnavailable(format!(
                "forwarder returned {status}: {}",
                body.trim()
            )));
        }

        let parsed: SamplesResponse = response
            .json()
            .map_err(|err| NodeError::SinkUnavailable(format!("invalid forwarder response: {err}")))?;
        Ok(parsed.accepted as usize)
    }
}
