//! HAR capture replay
//!
//! Feeds recorded traffic through a [`SimulatedHost`] so a capture can be
//! checked offline for forgeable delegation chains.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::host::{InterceptedExchange, SimulatedHost};

/// Default number of entries replayed concurrently
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Outcome of replaying one capture
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub entries: usize,
    pub exchanges: usize,
    pub rewritten: usize,
    /// URLs of exchanges whose body was substituted, in capture order
    pub rewritten_urls: Vec<String>,
}

/// Parse a HAR document into request/response exchange pairs
pub fn load_har(content: &str) -> Result<Vec<InterceptedExchange>> {
    let har: HarFile = serde_json::from_str(content).context("Failed to parse HAR file")?;
    let mut next_id = 0u64;
    let mut id = || {
        next_id += 1;
        next_id
    };
    let mut exchanges = Vec::with_capacity(har.log.entries.len() * 2);

    for entry in &har.log.entries {
        let mut request = InterceptedExchange::new_request(
            id(),
            &entry.request.method,
            &entry.request.url,
        );
        request.headers = headers(&entry.request.headers);
        request.body = entry.request.post_data.as_ref().map(|p| p.text.clone().into_bytes());
        exchanges.push(request);

        if let Some(response) = &entry.response {
            let mut exchange = InterceptedExchange::new_response(
                id(),
                &entry.request.method,
                &entry.request.url,
                response.status,
            );
            exchange.headers = headers(&response.headers);
            exchange.body = response
                .content
                .as_ref()
                .map(|c| c.decode())
                .transpose()
                .with_context(|| format!("Bad response body for {}", entry.request.url))?;
            exchanges.push(exchange);
        }
    }

    Ok(exchanges)
}

/// Dispatch every exchange through `host`, at most `concurrency` at a time
pub async fn replay(
    host: Arc<SimulatedHost>,
    exchanges: Vec<InterceptedExchange>,
    concurrency: usize,
) -> Result<ReplaySummary> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::with_capacity(exchanges.len());

    for exchange in exchanges {
        let permit = semaphore.clone().acquire_owned().await?;
        let host = host.clone();
        // Forgery signs on the calling thread; keep it off the async workers
        handles.push(tokio::task::spawn_blocking(move || {
            let before = exchange.body.clone();
            let out = host.dispatch(exchange);
            drop(permit);
            let rewritten = out.body != before;
            (out, rewritten)
        }));
    }

    let mut summary = ReplaySummary::default();
    let mut requests = 0;
    for handle in handles {
        let (exchange, rewritten) = handle.await.context("Replay worker failed")?;
        summary.exchanges += 1;
        if exchange.direction == crate::host::Direction::Request {
            requests += 1;
        }
        if rewritten {
            tracing::info!(id = exchange.id, url = %exchange.url, "Delegation substituted");
            summary.rewritten += 1;
            summary.rewritten_urls.push(exchange.url);
        }
    }
    summary.entries = requests;

    tracing::info!(
        entries = summary.entries,
        exchanges = summary.exchanges,
        rewritten = summary.rewritten,
        "Replay complete"
    );
    Ok(summary)
}

fn headers(list: &[HarHeader]) -> HashMap<String, String> {
    list.iter()
        .filter(|h| !h.name.starts_with(':'))
        .map(|h| (h.name.to_ascii_lowercase(), h.value.clone()))
        .collect()
}

// HAR file structures

#[derive(Debug, Deserialize)]
struct HarFile {
    log: HarLog,
}

#[derive(Debug, Deserialize)]
struct HarLog {
    entries: Vec<HarEntry>,
}

#[derive(Debug, Deserialize)]
struct HarEntry {
    request: HarRequest,
    #[serde(default)]
    response: Option<HarResponse>,
}

#[derive(Debug, Deserialize)]
struct HarRequest {
    method: String,
    url: String,
    #[serde(default)]
    headers: Vec<HarHeader>,
    #[serde(rename = "postData")]
    post_data: Option<HarPostData>,
}

#[derive(Debug, Deserialize)]
struct HarResponse {
    status: u16,
    #[serde(default)]
    headers: Vec<HarHeader>,
    content: Option<HarContent>,
}

#[derive(Debug, Deserialize)]
struct HarHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct HarPostData {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct HarContent {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

impl HarContent {
    fn decode(&self) -> Result<Vec<u8>> {
        let text = self.text.as_deref().unwrap_or_default();
        match self.encoding.as_deref() {
            Some("base64") => STANDARD.decode(text).context("Invalid base64 content"),
            _ => Ok(text.as_bytes().to_vec()),
        }
    }
}
