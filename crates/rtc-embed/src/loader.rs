//! Coordinator code loader
//!
//! Fetches the versioned coordinator script from
//! `{base}/embed/webrtc-embed-{version}.js`. Two fetch policies:
//!
//! - `CacheBust` appends `?nocache={unix_millis}&v={version}` so every load
//!   bypasses intermediate caches.
//! - `Pinned` fetches the bare versioned URL and requires the bytes to hash
//!   to a known BLAKE3 digest.
//!
//! Failures are reported as `TransportError::LoadFailed` and never retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use rtc_core::crypto::{content_digest, verify_digest};
use rtc_core::{unix_now_millis, LoaderConfig, TransportError};

/// How the coordinator code is fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchPolicy {
    /// Unique query string per load
    CacheBust,
    /// Version-pinned, content-addressed by a hex BLAKE3 digest
    Pinned { blake3: String },
}

/// Fetched coordinator code
#[derive(Debug, Clone)]
pub struct CoordinatorCode {
    pub url: Url,
    pub version: String,
    pub bytes: Vec<u8>,
    /// Hex BLAKE3 digest of `bytes`
    pub digest: String,
}

/// Loader for the coordinator script
pub struct CoordinatorLoader {
    base: Url,
    version: String,
    policy: FetchPolicy,
    client: reqwest::Client,
    /// Last cache-bust stamp handed out; keeps stamps unique within a millisecond
    last_stamp: AtomicU64,
}

impl CoordinatorLoader {
    pub fn new(
        base_url: &str,
        version: impl Into<String>,
        policy: FetchPolicy,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut base = Url::parse(base_url)
            .map_err(|e| TransportError::LoadFailed(format!("invalid base url {}: {}", base_url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .user_agent(format!("rtc-embed/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::LoadFailed(e.to_string()))?;

        Ok(Self {
            base,
            version: version.into(),
            policy,
            client,
            last_stamp: AtomicU64::new(0),
        })
    }

    /// Loader configured from the `[loader]` section
    pub fn from_config(config: &LoaderConfig) -> Result<Self, TransportError> {
        let policy = match &config.pinned_digest {
            Some(digest) => FetchPolicy::Pinned {
                blake3: digest.clone(),
            },
            None => FetchPolicy::CacheBust,
        };
        Self::new(
            &config.base_url,
            config.release_version.clone(),
            policy,
            Duration::from_secs(config.fetch_timeout_secs),
        )
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Versioned script URL without any query
    pub fn script_url(&self) -> Result<Url, TransportError> {
        self.base
            .join(&format!("embed/webrtc-embed-{}.js", self.version))
            .map_err(|e| TransportError::LoadFailed(e.to_string()))
    }

    /// URL for the next fetch under the current policy
    pub fn request_url(&self) -> Result<Url, TransportError> {
        let mut url = self.script_url()?;

        if self.policy == FetchPolicy::CacheBust {
            let stamp = self.next_stamp();
            url.query_pairs_mut()
                .append_pair("nocache", &stamp.to_string())
                .append_pair("v", &self.version);
        }

        Ok(url)
    }

    /// Fetch the coordinator code
    pub async fn load(&self) -> Result<CoordinatorCode, TransportError> {
        let url = self.request_url()?;
        debug!("Loading coordinator code from {}", url);

        let response = self.client.get(url.clone()).send().await.map_err(|e| {
            warn!("Coordinator code fetch failed: {}", e);
            TransportError::LoadFailed(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!("Coordinator code fetch returned {}", status);
            return Err(TransportError::LoadFailed(format!("HTTP {} from {}", status, url)));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::LoadFailed(e.to_string()))?
            .to_vec();

        if let FetchPolicy::Pinned { blake3 } = &self.policy {
            if !verify_digest(&bytes, blake3) {
                warn!("Coordinator code digest mismatch for {}", url);
                return Err(TransportError::LoadFailed(format!(
                    "digest mismatch: expected {}, got {}",
                    blake3,
                    content_digest(&bytes)
                )));
            }
        }

        info!(
            "Loaded coordinator code {} ({} bytes)",
            self.version,
            bytes.len()
        );

        Ok(CoordinatorCode {
            url,
            version: self.version.clone(),
            digest: content_digest(&bytes),
            bytes,
        })
    }

    /// Current time in milliseconds, strictly increasing per loader
    fn next_stamp(&self) -> u64 {
        let now = u64::try_from(unix_now_millis()).unwrap_or(u64::MAX);
        let mut last = self.last_stamp.load(Ordering::Relaxed);
        loop {
            let stamp = now.max(last + 1);
            match self
                .last_stamp
                .compare_exchange_weak(last, stamp, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return stamp,
                Err(current) => last = current,
            }
        }
    }
}
