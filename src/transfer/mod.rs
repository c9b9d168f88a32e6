//! Bounded transfer service
//!
//! Fetches one remote asset to its local destination. A transfer streams into a
//! sibling `.part` file and is renamed into place only once complete, so a file
//! at the destination path is always a finished download. Simultaneous transfers
//! are capped by a permit pool shared by every clone of [`HttpTransfer`].

use crate::config::TransferConfig;
use crate::error::{Error, Result, TransferError};
use crate::types::Asset;
use crate::utils::partial_path;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a successful fetch was satisfied
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The asset was fetched over the network
    Downloaded {
        /// Number of bytes written
        bytes: u64,
    },
    /// The destination already existed; nothing was transferred
    AlreadyPresent,
}

/// Fetches a single asset to its destination
///
/// Implementations must honour `cancel` at every suspension point and return
/// [`Error::Cancelled`] when it fires.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Bring `asset` to `asset.destination`
    async fn fetch(&self, asset: &Asset, cancel: &CancellationToken) -> Result<TransferOutcome>;
}

/// HTTP implementation of [`Fetcher`] with a global permit pool
#[derive(Clone)]
pub struct HttpTransfer {
    client: reqwest::Client,
    permits: Arc<Semaphore>,
}

impl HttpTransfer {
    /// Build a client and permit pool from configuration
    pub fn new(config: &TransferConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self::with_client(client, config.max_concurrent_transfers))
    }

    /// Use an existing client with a pool of `slots` permits
    pub fn with_client(client: reqwest::Client, slots: usize) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(slots)),
        }
    }

    /// Permits currently free in the pool
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Stream the response body into `partial`, returning byte count and SHA-256
    async fn stream_to(&self, asset: &Asset, partial: &Path) -> Result<(u64, String)> {
        let url = asset.locator().as_str();
        let mut response = self.client.get(asset.locator().clone()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            }
            .into());
        }

        let mut file = tokio::fs::File::create(partial).await?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok((written, format!("{:x}", hasher.finalize())))
    }
}

#[async_trait]
impl Fetcher for HttpTransfer {
    async fn fetch(&self, asset: &Asset, cancel: &CancellationToken) -> Result<TransferOutcome> {
        let destination = &asset.destination;
        if tokio::fs::try_exists(destination).await? {
            debug!(asset = %asset.index, ?destination, "destination exists, skipping transfer");
            return Ok(TransferOutcome::AlreadyPresent);
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = Arc::clone(&self.permits).acquire_owned() => permit
                .map_err(|_| Error::Other("transfer permit pool closed".to_string()))?,
        };

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(destination);

        info!(asset = %asset.index, url = %asset.locator(), "starting transfer");
        let streamed = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.stream_to(asset, &partial) => result,
        };
        // free the slot before the rename so other transfers are not held up
        drop(permit);
        let (bytes, digest) = streamed?;

        if let Some(expected) = &asset.spec.sha256
            && *expected != digest
        {
            warn!(asset = %asset.index, expected = %expected, actual = %digest, "checksum mismatch");
            if let Err(e) = tokio::fs::remove_file(&partial).await {
                debug!(error = %e, ?partial, "failed to remove rejected partial file");
            }
            return Err(TransferError::ChecksumMismatch {
                path: destination.clone(),
                expected: expected.clone(),
                actual: digest,
            }
            .into());
        }

        tokio::fs::rename(&partial, destination).await?;
        info!(asset = %asset.index, bytes, ?destination, "transfer complete");
        Ok(TransferOutcome::Downloaded { bytes })
    }
}
