//! Direct HTTP transport.
//!
//! One reusable client per worker: connection reuse, gzip, and redirect
//! caps are the client's responsibility, not the state machine's. The body
//! is streamed so an oversized artifact stops downloading shortly past the
//! configured ceiling instead of buffering 100 MiB of junk.

use std::time::Instant;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE};
use reqwest::redirect::Policy;
use tokio_util::sync::CancellationToken;

use crate::config::HttpConfig;
use crate::error::{CollectError, Result};

use super::{FetchTransport, FetchedPayload};

#[derive(Debug, Clone)]
pub struct DirectFetcher {
    client: reqwest::Client,
    accept: String,
    accept_language: String,
    /// Streaming stops shortly after this many bytes; Gate 2 rejects the
    /// oversized payload.
    max_body_bytes: u64,
}

impl DirectFetcher {
    pub fn new(config: &HttpConfig, max_body_bytes: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .gzip(true)
            .redirect(Policy::limited(config.max_redirects))
            .timeout(config.request_timeout())
            .read_timeout(config.read_timeout())
            .build()?;
        Ok(Self {
            client,
            accept: config.accept.clone(),
            accept_language: config.accept_language.clone(),
            max_body_bytes,
        })
    }
}

#[async_trait]
impl FetchTransport for DirectFetcher {
    async fn fetch(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchedPayload> {
        let started = Instant::now();

        let request = self
            .client
            .get(url)
            .header(ACCEPT, &self.accept)
            .header(ACCEPT_LANGUAGE, &self.accept_language);

        let mut response = tokio::select! {
            _ = cancel.cancelled() => return Err(CollectError::Cancelled),
            sent = request.send() => sent?,
        };

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let final_url = response.url().to_string();

        let mut bytes = Vec::with_capacity(
            response
                .content_length()
                .map(|len| len.min(self.max_body_bytes) as usize)
                .unwrap_or(64 * 1024),
        );
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(CollectError::Cancelled),
                chunk = response.chunk() => chunk?,
            };
            match chunk {
                Some(chunk) => {
                    bytes.extend_from_slice(&chunk);
                    if bytes.len() as u64 > self.max_body_bytes {
                        break;
                    }
                }
                None => break,
            }
        }

        Ok(FetchedPayload {
            status,
            content_type,
            bytes,
            elapsed: started.elapsed(),
            final_url,
        })
    }
}
