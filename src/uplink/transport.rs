//! HTTP delivery.
//!
//! Request: `POST server_url` with headers
//! - `Content-Type: application/json`
//! - `X-Payload-Encoding: zlib | identity`
//! - `X-Schema-Version: 1`
//! - `X-Device-ID: <device_id>`
//! - `X-Attempt: <n>`
//!
//! Outcome: 2xx delivered. 408, 429, 5xx and transport errors are retried. Any other
//! status means the server will never accept the body, so it is spooled at once.

use anyhow::{anyhow, Result};
use std::time::Duration;

use super::codec::{PayloadEncoding, SCHEMA_VERSION};

pub struct UplinkRequest<'a> {
    pub body: &'a [u8],
    pub encoding: PayloadEncoding,
    pub device_id: &'a str,
    pub attempt: u32,
    /// Tighter bound than the transport's own timeout, set while shutting down.
    pub timeout: Option<Duration>,
}

/// Something that can carry one request to the server.
///
/// `Ok(status)` for any HTTP response, `Err` when no response arrived.
pub trait Transport: Send {
    fn post(&mut self, request: &UplinkRequest<'_>) -> Result<u16>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Retry(String),
    Rejected(String),
}

pub fn classify(result: &Result<u16>) -> Delivery {
    match result {
        Ok(status) if (200..300).contains(status) => Delivery::Delivered,
        Ok(status @ (408 | 429)) => Delivery::Retry(format!("HTTP {}", status)),
        Ok(status) if *status >= 500 => Delivery::Retry(format!("HTTP {}", status)),
        Ok(status) => Delivery::Rejected(format!("HTTP {}", status)),
        Err(err) => Delivery::Retry(format!("{:#}", err)),
    }
}

pub struct HttpTransport {
    agent: ureq::Agent,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            url: url.into(),
        }
    }

    /// One GET against a health endpoint. Returns the status code.
    pub fn probe(&self, health_url: &str) -> Result<u16> {
        match self.agent.get(health_url).call() {
            Ok(response) => Ok(response.status()),
            Err(ureq::Error::Status(code, _)) => Ok(code),
            Err(ureq::Error::Transport(err)) => Err(anyhow!("health probe failed: {}", err)),
        }
    }
}

impl Transport for HttpTransport {
    fn post(&mut self, request: &UplinkRequest<'_>) -> Result<u16> {
        let mut builder = self.agent.post(&self.url);
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        let result = builder
            .set("Content-Type", "application/json")
            .set("X-Payload-Encoding", request.encoding.as_str())
            .set("X-Schema-Version", &SCHEMA_VERSION.to_string())
            .set("X-Device-ID", request.device_id)
            .set("X-Attempt", &request.attempt.to_string())
            .send_bytes(request.body);
        match result {
            Ok(response) => Ok(response.status()),
            Err(ureq::Error::Status(code, _)) => Ok(code),
            Err(ureq::Error::Transport(err)) => Err(anyhow!("{}", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert_eq!(classify(&Ok(200)), Delivery::Delivered);
        assert_eq!(classify(&Ok(204)), Delivery::Delivered);
        assert!(matches!(classify(&Ok(500)), Delivery::Retry(_)));
        assert!(matches!(classify(&Ok(503)), Delivery::Retry(_)));
        assert!(matches!(classify(&Ok(429)), Delivery::Retry(_)));
        assert!(matches!(classify(&Ok(408)), Delivery::Retry(_)));
        assert!(matches!(classify(&Ok(400)), Delivery::Rejected(_)));
        assert!(matches!(classify(&Ok(413)), Delivery::Rejected(_)));
        assert!(matches!(classify(&Ok(301)), Delivery::Rejected(_)));
    }

    #[test]
    fn transport_errors_are_retried() {
        let err: Result<u16> = Err(anyhow!("connection refused"));
        assert_eq!(
            classify(&err),
            Delivery::Retry("connection refused".to_string())
        );
    }
}
