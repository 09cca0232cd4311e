//! Node operations on a session.

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::retry::sleep_or_shutdown;
use super::Session;
use crate::error::CoordError;
use crate::node::{CreateMode, CreateOptions, DeleteOptions, NodeData, Stat};
use crate::path;
use crate::Result;

impl Session {
    /// Create a node and return its path.
    ///
    /// Without `data` the session's default data is stored. If a retry after
    /// connection loss finds the node already present and it is evidently
    /// the one this call created, the create counts as successful.
    pub async fn create(
        &self,
        path: &str,
        data: Option<Vec<u8>>,
        options: CreateOptions,
    ) -> Result<String> {
        path::validate(path)?;
        let data = data.unwrap_or_else(|| self.inner.config.default_data.clone());
        let mut interrupted = false;

        let result = self
            .retrying("create", |inner| {
                let result = inner.ensemble.create(
                    inner.id,
                    path,
                    data.clone(),
                    options.mode,
                    options.create_parents,
                );
                if matches!(result, Err(CoordError::ConnectionLoss)) {
                    interrupted = true;
                }
                result
            })
            .await;

        match result {
            Err(CoordError::NodeExists(_)) if interrupted && self.created_by_us(path, &data, options.mode) => {
                debug!("create of {} was applied before the connection dropped", path);
                Ok(path.to_string())
            }
            other => other,
        }
    }

    fn created_by_us(&self, path: &str, data: &[u8], mode: CreateMode) -> bool {
        let Ok(node) = self.inner.ensemble.get(self.inner.id, path) else {
            return false;
        };
        let owner_matches = match mode {
            CreateMode::Ephemeral => node.stat.ephemeral_owner == self.inner.id.as_u64(),
            CreateMode::Persistent => node.stat.ephemeral_owner == 0,
        };
        owner_matches && node.stat.version == 0 && node.data == data
    }

    /// Read a node's data and stat.
    pub async fn read(&self, path: &str) -> Result<(Vec<u8>, Stat)> {
        let node = self.get(path).await?;
        Ok((node.data, node.stat))
    }

    /// Read a node as a whole.
    pub async fn get(&self, path: &str) -> Result<NodeData> {
        path::validate(path)?;
        self.retrying("read", |inner| inner.ensemble.get(inner.id, path))
            .await
    }

    /// Stat of a node, or `None` if it does not exist.
    pub async fn exists(&self, path: &str) -> Result<Option<Stat>> {
        path::validate(path)?;
        self.retrying("exists", |inner| inner.ensemble.exists(inner.id, path))
            .await
    }

    /// Replace a node's data.
    ///
    /// With `expected_version` the write only succeeds if the stored version
    /// still matches; otherwise [`CoordError::VersionConflict`] is returned.
    /// Each successful write bumps the version by exactly one.
    ///
    /// Unconditional writes are pinned to the version read just before, so a
    /// retry after a lost reply cannot apply the same write twice. If such a
    /// retry conflicts and the node holds our data exactly one version past
    /// the pin, the earlier attempt landed and its stat is returned.
    pub async fn write(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<u32>,
    ) -> Result<Stat> {
        path::validate(path)?;
        let mut pinned = expected_version;
        let mut interrupted = false;

        self.retrying("write", |inner| loop {
            let expected = match pinned {
                Some(version) => version,
                None => {
                    let version = inner.ensemble.get(inner.id, path)?.stat.version;
                    pinned = Some(version);
                    version
                }
            };

            match inner
                .ensemble
                .set(inner.id, path, data.clone(), Some(expected))
            {
                Err(CoordError::ConnectionLoss) => {
                    interrupted = true;
                    return Err(CoordError::ConnectionLoss);
                }
                Err(CoordError::VersionConflict {
                    path: conflict_path,
                    expected,
                    actual,
                }) => {
                    if interrupted && actual == expected + 1 {
                        let node = inner.ensemble.get(inner.id, path)?;
                        if node.stat.version == actual && node.data == data {
                            debug!("write to {} was applied before the connection dropped", path);
                            return Ok(node.stat);
                        }
                    }
                    if expected_version.is_some() {
                        return Err(CoordError::VersionConflict {
                            path: conflict_path,
                            expected,
                            actual,
                        });
                    }
                    // Someone else wrote in between; take their version and go again.
                    pinned = Some(actual);
                    interrupted = false;
                }
                other => return other,
            }
        })
        .await
    }

    /// Names of a node's immediate children, sorted.
    pub async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        path::validate(path)?;
        self.retrying("list children", |inner| inner.ensemble.children(inner.id, path))
            .await
    }

    /// Delete a node.
    ///
    /// `recursive` removes descendants first; without it a node with
    /// children fails with [`CoordError::NotEmpty`]. `guaranteed` keeps
    /// retrying connection loss with capped backoff, ignoring the retry
    /// budget, until the delete is confirmed or the session ends.
    ///
    /// In both modes a `NotFound` seen on a retry after connection loss is
    /// taken as the earlier attempt having gone through.
    pub async fn delete(&self, path: &str, options: DeleteOptions) -> Result<()> {
        path::validate(path)?;
        if options.guaranteed {
            return self.delete_guaranteed(path, options.recursive).await;
        }
        let mut interrupted = false;
        self.retrying("delete", |inner| {
            match inner.ensemble.delete(inner.id, path, options.recursive) {
                Err(CoordError::ConnectionLoss) => {
                    interrupted = true;
                    Err(CoordError::ConnectionLoss)
                }
                // The lost attempt already removed it.
                Err(CoordError::NotFound(_)) if interrupted => {
                    debug!("delete of {} already applied", path);
                    Ok(())
                }
                other => other,
            }
        })
        .await
    }

    async fn delete_guaranteed(&self, path: &str, recursive: bool) -> Result<()> {
        let inner = &*self.inner;
        let policy = inner.config.retry;
        let mut shutdown = inner.shutdown_signal();
        let mut retry = 0u32;
        let mut interrupted = false;

        loop {
            inner.check_usable()?;
            match inner.ensemble.delete(inner.id, path, recursive) {
                Ok(()) => return Ok(()),
                // An earlier attempt went through but its reply was lost.
                Err(CoordError::NotFound(_)) if interrupted => {
                    debug!("guaranteed delete of {} already applied", path);
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    interrupted = true;
                    let delay = policy.delay_for(retry);
                    retry = retry.saturating_add(1);
                    warn!(
                        "guaranteed delete of {} failed ({}), retry {} in {:?}",
                        path, e, retry, delay
                    );
                    if !sleep_or_shutdown(delay, &mut shutdown).await {
                        return Err(inner.refine(CoordError::SessionClosed));
                    }
                }
                Err(e) => return Err(inner.refine(e)),
            }
        }
    }

    /// Delete on a background task. The handle resolves once the delete is
    /// confirmed or has failed for good.
    pub fn delete_in_background(
        &self,
        path: impl Into<String>,
        options: DeleteOptions,
    ) -> JoinHandle<Result<()>> {
        let session = self.clone();
        let path = path.into();
        tokio::spawn(async move {
            let result = session.delete(&path, options).await;
            match &result {
                Ok(()) => info!("{} deleted", path),
                Err(e) => warn!("background delete of {} failed: {}", path, e),
            }
            result
        })
    }
}
