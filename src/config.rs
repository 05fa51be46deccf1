//! Client configuration.
//!
//! Plain structs with defaults taken from the production connector; every field has a
//! chaining `with_*` setter. Nothing here reads files or the environment.
use std::{fmt, sync::Arc, time::Duration};

use crate::{cloudfetch::Decryptor, protocol::ExecuteOptions};

/// Backoff and budget applied to every RPC and file download.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub delay_min: Duration,
    /// Ceiling for any single delay.
    pub delay_max: Duration,
    /// Growth factor per failed attempt.
    pub multiplier: f64,
    /// Upper bound of the random extra added to each delay, as a fraction of it.
    pub jitter: f64,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Wall time from the first attempt after which no further retry is scheduled.
    pub max_duration: Duration,
    pub max_redirects: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delay_min: Duration::from_secs(1),
            delay_max: Duration::from_secs(60),
            multiplier: 1.5,
            jitter: 0.1,
            max_attempts: 30,
            max_duration: Duration::from_secs(900),
            max_redirects: 5,
        }
    }
}

impl RetryConfig {
    pub fn with_delay_min(mut self, delay: Duration) -> Self {
        self.delay_min = delay;
        self
    }

    pub fn with_delay_max(mut self, delay: Duration) -> Self {
        self.delay_max = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = duration;
        self
    }

    pub fn with_max_redirects(mut self, redirects: u32) -> Self {
        self.max_redirects = redirects;
        self
    }
}

/// Settings for staged-result downloads.
#[derive(Clone)]
pub struct CloudFetchConfig {
    /// Download workers, and so the maximum number of in-flight downloads.
    pub max_download_threads: usize,
    /// Completed-but-unconsumed batches allowed before workers stop starting downloads.
    /// Downloads already in flight still finish, so up to `max_download_threads` more may land.
    pub max_buffered_batches: usize,
    /// Links expiring within this window are treated as already expired.
    pub link_expiry_buffer: Duration,
    /// Rows requested per link page.
    pub link_page_rows: u64,
    pub decryptor: Option<Arc<dyn Decryptor>>,
}

impl Default for CloudFetchConfig {
    fn default() -> Self {
        Self {
            max_download_threads: 10,
            max_buffered_batches: 4,
            link_expiry_buffer: Duration::ZERO,
            link_page_rows: 10_000,
            decryptor: None,
        }
    }
}

impl fmt::Debug for CloudFetchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudFetchConfig")
            .field("max_download_threads", &self.max_download_threads)
            .field("max_buffered_batches", &self.max_buffered_batches)
            .field("link_expiry_buffer", &self.link_expiry_buffer)
            .field("link_page_rows", &self.link_page_rows)
            .field("decryptor", &self.decryptor.is_some())
            .finish()
    }
}

impl CloudFetchConfig {
    pub fn with_max_download_threads(mut self, threads: usize) -> Self {
        self.max_download_threads = threads;
        self
    }

    pub fn with_max_buffered_batches(mut self, batches: usize) -> Self {
        self.max_buffered_batches = batches;
        self
    }

    pub fn with_link_expiry_buffer(mut self, buffer: Duration) -> Self {
        self.link_expiry_buffer = buffer;
        self
    }

    pub fn with_link_page_rows(mut self, rows: u64) -> Self {
        self.link_page_rows = rows;
        self
    }

    pub fn with_decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Where RPCs are sent; interpreted by the transport.
    pub endpoint: String,
    /// Return from submission without waiting for a direct result.
    pub run_async: bool,
    pub max_inline_rows: u64,
    pub max_inline_bytes: u64,
    pub use_cloud_fetch: bool,
    pub lz4_compression: bool,
    /// Rows requested per inline result page.
    pub fetch_page_rows: u64,
    pub retry: RetryConfig,
    pub cloudfetch: CloudFetchConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:7878".to_string(),
            run_async: false,
            max_inline_rows: 100_000,
            max_inline_bytes: 10 * 1024 * 1024,
            use_cloud_fetch: true,
            lz4_compression: true,
            fetch_page_rows: 10_000,
            retry: RetryConfig::default(),
            cloudfetch: CloudFetchConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn with_run_async(mut self, run_async: bool) -> Self {
        self.run_async = run_async;
        self
    }

    pub fn with_max_inline_rows(mut self, rows: u64) -> Self {
        self.max_inline_rows = rows;
        self
    }

    pub fn with_max_inline_bytes(mut self, bytes: u64) -> Self {
        self.max_inline_bytes = bytes;
        self
    }

    pub fn with_cloud_fetch(mut self, enabled: bool) -> Self {
        self.use_cloud_fetch = enabled;
        self
    }

    pub fn with_lz4_compression(mut self, enabled: bool) -> Self {
        self.lz4_compression = enabled;
        self
    }

    pub fn with_fetch_page_rows(mut self, rows: u64) -> Self {
        self.fetch_page_rows = rows;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cloudfetch(mut self, cloudfetch: CloudFetchConfig) -> Self {
        self.cloudfetch = cloudfetch;
        self
    }

    pub(crate) fn execute_options(&self) -> ExecuteOptions {
        ExecuteOptions {
            run_async: self.run_async,
            max_inline_rows: self.max_inline_rows,
            max_inline_bytes: self.max_inline_bytes,
            allow_staged: self.use_cloud_fetch,
            compression: self.lz4_compression,
        }
    }
}
