//! The transport boundary: "send N requests, collect N responses".
//!
//! The send loop fans every round out through this trait and nothing else.
//! The provided [`HttpTransport`] posts JSON over reqwest with a per-request
//! timeout; tests drop in scripted implementations.

use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    #[error("transport failure: {0}")]
    Failed(String),
}

/// One round of fan-out. Implementations MUST return exactly one entry per
/// request, in request order, and SHOULD contact the nodes in parallel.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        requests: Vec<TransportRequest>,
        timeout_ms: u64,
    ) -> Vec<Result<TransportResponse, TransportError>>;
}

/// Production transport: HTTP POST with `application/json`.
#[derive(Debug, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        requests: Vec<TransportRequest>,
        timeout_ms: u64,
    ) -> Vec<Result<TransportResponse, TransportError>> {
        let calls = requests.into_iter().map(|request| {
            let client = self.client.clone();
            async move {
                let started = Instant::now();
                let send = client
                    .post(&request.url)
                    .header("content-type", "application/json")
                    .body(request.body)
                    .send();
                let response = tokio::time::timeout(
                    std::time::Duration::from_millis(timeout_ms),
                    send,
                )
                .await
                .map_err(|_| TransportError::Timeout(timeout_ms))?
                .map_err(|err| TransportError::Failed(err.to_string()))?;
                let status = response.status().as_u16();
                let body = response
                    .text()
                    .await
                    .map_err(|err| TransportError::Failed(err.to_string()))?;
                Ok(TransportResponse {
                    status,
                    body,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        });
        join_all(calls).await
    }
}
