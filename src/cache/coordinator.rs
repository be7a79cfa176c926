//! Cache coordination: decides, per request, whether to serve, wait, or produce.
//!
//! Exactly one request may hold the lease on an entry and produce it. Everyone
//! else polls the entry's lease and tags until it is done, abandoned, or the
//! wait budget runs out.

use std::sync::Arc;

use bytes::Bytes;
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{
    blob::{BlobError, BlobStore, LeaseHandle, in_progress_tags, is_done},
    clock::Clock,
    config::CacheConfig,
    keys::CacheKey,
};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Blob(#[from] BlobError),
}

/// Outcome of resolving a cache key.
#[derive(Debug)]
pub enum Resolution {
    ServeFromCache(Bytes),
    Redirect(String),
    BecomeProducer(LeaseHandle),
    /// The wait budget ran out; compute directly without caching.
    Fallback,
}

impl Resolution {
    fn outcome(&self) -> &'static str {
        match self {
            Resolution::ServeFromCache(_) => "serve",
            Resolution::Redirect(_) => "redirect",
            Resolution::BecomeProducer(_) => "produce",
            Resolution::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Cold,
    Waiting { cycle: u32 },
    Reclaiming,
    Complete,
    Fallback,
}

/// What an inspection of the entry found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observation {
    Absent,
    InProgress,
    Abandoned,
    Complete,
}

enum Claim {
    Acquired(LeaseHandle),
    Contended,
    Vanished,
}

pub struct CacheCoordinator {
    store: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
}

impl CacheCoordinator {
    pub fn new(store: Arc<dyn BlobStore>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub async fn resolve(&self, key: &CacheKey) -> Result<Resolution, CoordinatorError> {
        let resolution = self.run(key).await?;
        counter!("ondata_cache_resolve_total", "outcome" => resolution.outcome()).increment(1);
        Ok(resolution)
    }

    async fn run(&self, key: &CacheKey) -> Result<Resolution, CoordinatorError> {
        let path = key.path();
        let mut state = CoordinatorState::Cold;
        // Waits and reclaims share one budget so contention cannot loop forever.
        let mut spent: u32 = 0;

        loop {
            debug!(target = "ondata::cache::coordinator", cache_path = path, ?state, "step");
            state = match state {
                CoordinatorState::Cold => match self.claim(path).await? {
                    Claim::Acquired(lease) => {
                        histogram!("ondata_cache_wait_cycles").record(f64::from(spent));
                        info!(
                            target = "ondata::cache::coordinator",
                            cache_path = path,
                            "claimed entry; producing"
                        );
                        return Ok(Resolution::BecomeProducer(lease));
                    }
                    Claim::Contended => self.classify(self.observe(path).await?, spent),
                    Claim::Vanished => CoordinatorState::Cold,
                },
                CoordinatorState::Waiting { cycle } => {
                    if cycle >= self.config.max_wait_cycles {
                        CoordinatorState::Fallback
                    } else {
                        self.clock.sleep(self.config.poll_interval()).await;
                        spent = cycle + 1;
                        self.classify(self.observe(path).await?, spent)
                    }
                }
                CoordinatorState::Reclaiming => {
                    spent += 1;
                    if spent > self.config.max_wait_cycles {
                        CoordinatorState::Fallback
                    } else {
                        self.reclaim(path, spent).await?
                    }
                }
                CoordinatorState::Complete => {
                    histogram!("ondata_cache_wait_cycles").record(f64::from(spent));
                    match self.deliver(key).await? {
                        Some(resolution) => return Ok(resolution),
                        None => CoordinatorState::Cold,
                    }
                }
                CoordinatorState::Fallback => {
                    warn!(
                        target = "ondata::cache::coordinator",
                        cache_path = path,
                        cycles = spent,
                        "cache wait budget exhausted; computing directly"
                    );
                    return Ok(Resolution::Fallback);
                }
            };
        }
    }

    /// Creates the entry and takes its lease, or reports why that was not possible.
    async fn claim(&self, path: &str) -> Result<Claim, CoordinatorError> {
        match self.store.create_empty(path).await {
            Ok(()) => {}
            Err(BlobError::AlreadyExists { .. }) => return Ok(Claim::Contended),
            Err(err) => return Err(err.into()),
        }

        let lease = match self
            .store
            .acquire_lease(path, self.config.lease_duration())
            .await
        {
            Ok(lease) => lease,
            Err(BlobError::LeaseConflict { .. }) => return Ok(Claim::Contended),
            Err(BlobError::NotFound { .. }) => return Ok(Claim::Vanished),
            Err(err) => return Err(err.into()),
        };

        match self
            .store
            .set_tags(path, in_progress_tags(), Some(&lease))
            .await
        {
            Ok(()) => Ok(Claim::Acquired(lease)),
            Err(BlobError::NotFound { .. } | BlobError::LeaseLost { .. }) => Ok(Claim::Vanished),
            Err(err) => Err(err.into()),
        }
    }

    async fn observe(&self, path: &str) -> Result<Observation, CoordinatorError> {
        let properties = match self.store.get_properties(path).await {
            Ok(properties) => properties,
            Err(err) if err.is_not_found() => return Ok(Observation::Absent),
            Err(err) => return Err(err.into()),
        };

        if properties.lease.is_locked() {
            return Ok(Observation::InProgress);
        }

        let tags = match self.store.get_tags(path).await {
            Ok(tags) => tags,
            Err(err) if err.is_not_found() => return Ok(Observation::Absent),
            Err(err) => return Err(err.into()),
        };

        Ok(if is_done(&tags) {
            Observation::Complete
        } else {
            Observation::Abandoned
        })
    }

    fn classify(&self, observation: Observation, cycle: u32) -> CoordinatorState {
        match observation {
            Observation::Absent => CoordinatorState::Cold,
            Observation::InProgress => CoordinatorState::Waiting { cycle },
            Observation::Abandoned => CoordinatorState::Reclaiming,
            Observation::Complete => CoordinatorState::Complete,
        }
    }

    async fn reclaim(&self, path: &str, spent: u32) -> Result<CoordinatorState, CoordinatorError> {
        match self.store.delete(path, None).await {
            Ok(()) => {
                counter!("ondata_cache_reclaim_total").increment(1);
                info!(
                    target = "ondata::cache::coordinator",
                    cache_path = path,
                    "removed abandoned entry"
                );
                Ok(CoordinatorState::Cold)
            }
            Err(err) if err.is_not_found() => Ok(CoordinatorState::Cold),
            Err(BlobError::LeaseConflict { .. }) => Ok(CoordinatorState::Waiting { cycle: spent }),
            Err(err) => Err(err.into()),
        }
    }

    /// Hands out a finished entry; `None` means it disappeared in the meantime.
    async fn deliver(&self, key: &CacheKey) -> Result<Option<Resolution>, CoordinatorError> {
        if self.config.redirects(key.format()) {
            return Ok(Some(Resolution::Redirect(
                self.store.public_location(key.path()),
            )));
        }

        match self.store.download(key.path()).await {
            Ok(bytes) => Ok(Some(Resolution::ServeFromCache(bytes))),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
