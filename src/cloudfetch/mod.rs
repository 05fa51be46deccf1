//! Concurrent download of staged result files.
//!
//! When a result is too large to travel inline the server writes it to storage and returns
//! pre-signed links, each covering a contiguous range of rows. [`CloudFetchDownloader`]
//! fetches those files with a bounded worker pool and hands the decoded batches to the
//! consumer strictly in row order.
//!
//! Two seams keep this module independent of the RPC layer and of storage:
//!
//! - [`FileFetcher`] performs the unauthenticated GET of one link.
//! - [`LinkResolver`] pages in further links and re-resolves expired ones.
//!
//! # File format
//!
//! See [`codec`] for the on-disk layout and the integrity checks applied to every file.
use std::{error::Error as StdError, sync::Arc, time::Duration};

use crate::{
    config::CloudFetchConfig,
    error::{Error, Result},
    protocol::EncryptionInfo,
};

pub mod codec;
mod downloader;
mod fetcher;

pub use downloader::{CloudFetchDownloader, DownloadTask, TaskState};
pub use fetcher::{FileFetcher, LocalFileFetcher, file_url};

pub use crate::protocol::FileReference;

/// Decrypts files written with server-side encryption.
pub trait Decryptor: Send + Sync {
    fn decrypt(
        &self,
        info: &EncryptionInfo,
        ciphertext: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, Box<dyn StdError + Send + Sync>>;
}

/// Source of links for one result.
pub trait LinkResolver: Send + Sync {
    /// Returns the next page of links starting at `start_row_offset` and whether more follow.
    fn fetch_links(&self, start_row_offset: i64) -> Result<(Vec<FileReference>, bool)>;

    /// Returns a fresh link for the file covering the same rows as `stale`.
    fn refresh(&self, stale: &FileReference) -> Result<FileReference> {
        let (links, _) = self.fetch_links(stale.row_offset)?;
        let fresh = links
            .into_iter()
            .find(|link| link.row_offset == stale.row_offset)
            .ok_or_else(|| {
                Error::integrity(stale.row_offset, "server returned no link for this offset")
            })?;

        if fresh.row_count != stale.row_count {
            return Err(Error::integrity(
                stale.row_offset,
                format!(
                    "refreshed link covers {} rows, expected {}",
                    fresh.row_count, stale.row_count
                ),
            ));
        }
        Ok(fresh)
    }
}

/// Per-result settings for one [`CloudFetchDownloader`].
#[derive(Clone)]
pub struct DownloaderOptions {
    pub max_download_threads: usize,
    pub max_buffered_batches: usize,
    pub link_expiry_buffer: Duration,
    /// Whether files are lz4 framed.
    pub compressed: bool,
    pub decryptor: Option<Arc<dyn Decryptor>>,
}

impl Default for DownloaderOptions {
    fn default() -> Self {
        Self::from_config(&CloudFetchConfig::default(), false)
    }
}

impl DownloaderOptions {
    pub fn from_config(config: &CloudFetchConfig, compressed: bool) -> Self {
        Self {
            max_download_threads: config.max_download_threads,
            max_buffered_batches: config.max_buffered_batches,
            link_expiry_buffer: config.link_expiry_buffer,
            compressed,
            decryptor: config.decryptor.clone(),
        }
    }
}
