//! Method signature lookup against the public 4byte directory.

use alloy_primitives::Selector;
use async_trait::async_trait;
use hmyload_core::{LoadError, LoadResult, Method};
use serde::Deserialize;
use std::time::Duration;

pub const FOUR_BYTE_URL: &str = "https://www.4byte.directory/api/v1/signatures/";

/// Resolves a 4-byte selector to a human-readable method.
#[async_trait]
pub trait SignatureDirectory: Send + Sync {
    /// `Ok(None)` when the directory has no entry for `selector`.
    async fn lookup(&self, selector: Selector) -> LoadResult<Option<Method>>;
}

#[derive(Deserialize)]
struct SignaturePage {
    #[serde(default)]
    results: Vec<SignatureEntry>,
}

#[derive(Deserialize)]
struct SignatureEntry {
    id: u64,
    text_signature: String,
}

/// HTTP client for `4byte.directory`. The oldest registration (lowest id)
/// wins when several signatures share a selector.
pub struct FourByteDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl FourByteDirectory {
    pub fn new(timeout: Duration) -> LoadResult<Self> {
        Self::with_base_url(FOUR_BYTE_URL, timeout)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration) -> LoadResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LoadError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
        })
    }
}

#[async_trait]
impl SignatureDirectory for FourByteDirectory {
    async fn lookup(&self, selector: Selector) -> LoadResult<Option<Method>> {
        let hex_signature = format!("0x{}", hex::encode(selector));
        let page: SignaturePage = self
            .client
            .get(self.base_url.as_str())
            .query(&[("hex_signature", hex_signature.as_str())])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| LoadError::Transport(format!("Signature lookup {hex_signature} failed: {e}")))?
            .json()
            .await
            .map_err(|e| LoadError::Decode(format!("Bad directory reply for {hex_signature}: {e}")))?;

        Ok(pick_oldest(selector, page.results))
    }
}

fn pick_oldest(selector: Selector, entries: Vec<SignatureEntry>) -> Option<Method> {
    entries
        .into_iter()
        .min_by_key(|e| e.id)
        .and_then(|e| Method::from_text_signature(selector, &e.text_signature))
}
