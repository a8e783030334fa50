//! LRU cache of resident methylomes with single-flight loads.
//!
//! One mutex guards the accession map and the recency list. A miss inserts
//! a loading placeholder and performs the disk load outside the lock;
//! concurrent getters for the same accession wait on the placeholder's
//! channel, so the loader runs exactly once per miss. Eviction removes an
//! entry from the map and list only; outstanding [`MethylomeHandle`]s keep
//! the evicted payload alive until the last one drops.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::index::CpgIndexSet;
use crate::methylome::{Methylome, MethylomeMeta, METHYLOME_EXTENSION};
use crate::{Error, Result};

/// A methylome resident in the cache, with its verified metadata.
#[derive(Debug)]
pub struct ResidentMethylome {
    pub methylome: Methylome,
    pub meta: MethylomeMeta,
}

/// Shared read handle; cloning is cheap and keeps the payload alive past
/// eviction.
pub type MethylomeHandle = Arc<ResidentMethylome>;

type LoadOutcome = std::result::Result<MethylomeHandle, String>;

enum Slot {
    Loading(watch::Receiver<Option<LoadOutcome>>),
    Ready(MethylomeHandle),
}

#[derive(Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    /// Accessions from least to most recently used.
    recency: VecDeque<String>,
}

pub struct MethylomeSet {
    dir: PathBuf,
    capacity: usize,
    admission_timeout: Duration,
    indexes: Arc<CpgIndexSet>,
    inner: Mutex<Inner>,
    n_loads: AtomicU64,
}

enum Step {
    Load(watch::Sender<Option<LoadOutcome>>, PathBuf),
    Wait(watch::Receiver<Option<LoadOutcome>>),
}

impl MethylomeSet {
    pub fn new(
        dir: PathBuf,
        capacity: usize,
        admission_timeout: Duration,
        indexes: Arc<CpgIndexSet>,
    ) -> MethylomeSet {
        MethylomeSet {
            dir,
            capacity: capacity.max(1),
            admission_timeout,
            indexes,
            inner: Mutex::new(Inner::default()),
            n_loads: AtomicU64::new(0),
        }
    }

    /// Resolve an accession to a resident methylome, loading on miss.
    pub async fn get(&self, accession: &str) -> Result<MethylomeHandle> {
        let deadline = Instant::now() + self.admission_timeout;
        loop {
            let step = {
                let mut guard = self.inner.lock().await;
                let inner = &mut *guard;
                if let Some(slot) = inner.slots.get(accession) {
                    match slot {
                        Slot::Ready(handle) => {
                            let handle = handle.clone();
                            touch(&mut inner.recency, accession);
                            return Ok(handle);
                        }
                        Slot::Loading(rx) => Step::Wait(rx.clone()),
                    }
                } else if inner.slots.len() >= self.capacity && !evict_lru(inner) {
                    // nothing evictable: every entry is mid-load; wait for
                    // one to settle and retry admission
                    match any_loading(&inner) {
                        Some(rx) => Step::Wait(rx),
                        None => return Err(Error::ServerBusy),
                    }
                } else {
                    let path = self
                        .dir
                        .join(format!("{accession}.{METHYLOME_EXTENSION}"));
                    if !path.exists() {
                        return Err(Error::UnknownAccession(accession.to_string()));
                    }
                    let (tx, rx) = watch::channel(None);
                    inner.slots.insert(accession.to_string(), Slot::Loading(rx));
                    inner.recency.push_back(accession.to_string());
                    Step::Load(tx, path)
                }
            };

            match step {
                Step::Load(tx, path) => {
                    self.n_loads.fetch_add(1, Ordering::Relaxed);
                    let result = self.load(path).await;
                    let mut inner = self.inner.lock().await;
                    match result {
                        Ok(handle) => {
                            inner
                                .slots
                                .insert(accession.to_string(), Slot::Ready(handle.clone()));
                            let _ = tx.send(Some(Ok(handle.clone())));
                            return Ok(handle);
                        }
                        Err(e) => {
                            inner.slots.remove(accession);
                            inner.recency.retain(|a| a != accession);
                            let _ = tx.send(Some(Err(e.to_string())));
                            return Err(e);
                        }
                    }
                }
                Step::Wait(mut rx) => loop {
                    let settled = rx.borrow().clone();
                    match settled {
                        Some(Ok(_)) => break, // re-check the map for the fresh entry
                        Some(Err(msg)) => return Err(Error::Internal(msg)),
                        None => match tokio::time::timeout_at(deadline, rx.changed()).await {
                            Err(_) => return Err(Error::ServerBusy),
                            Ok(Err(_)) => {
                                return Err(Error::Internal(
                                    "methylome load abandoned".to_string(),
                                ))
                            }
                            Ok(Ok(())) => {}
                        },
                    }
                },
            }
        }
    }

    async fn load(&self, path: PathBuf) -> Result<MethylomeHandle> {
        let opened = tokio::task::spawn_blocking(move || Methylome::open(&path))
            .await
            .map_err(|e| Error::Internal(format!("load task failed: {e}")))?;
        let (methylome, meta) = opened?;
        let index = self
            .indexes
            .get(&meta.assembly)
            .ok_or_else(|| Error::UnknownAssembly(meta.assembly.clone()))?;
        if meta.n_cpgs != index.meta.n_cpgs_total {
            return Err(Error::Integrity(format!(
                "methylome has {} sites but index {} has {}",
                meta.n_cpgs, meta.assembly, index.meta.n_cpgs_total
            )));
        }
        Ok(Arc::new(ResidentMethylome { methylome, meta }))
    }

    /// Times the loader has run; one per cache miss.
    pub fn n_loads(&self) -> u64 {
        self.n_loads.load(Ordering::Relaxed)
    }

    /// Resident accessions from least to most recently used.
    pub async fn resident(&self) -> Vec<String> {
        self.inner.lock().await.recency.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn touch(recency: &mut VecDeque<String>, accession: &str) {
    if let Some(at) = recency.iter().position(|a| a == accession) {
        if let Some(entry) = recency.remove(at) {
            recency.push_back(entry);
        }
    }
}

/// Drop the least-recently-used settled entry; loading entries stay.
fn evict_lru(inner: &mut Inner) -> bool {
    let candidate = inner
        .recency
        .iter()
        .position(|a| matches!(inner.slots.get(a), Some(Slot::Ready(_))));
    if let Some(accession) = candidate.and_then(|at| inner.recency.remove(at)) {
        inner.slots.remove(&accession);
        tracing::debug!(accession = %accession, "evicted methylome");
        return true;
    }
    false
}

fn any_loading(inner: &Inner) -> Option<watch::Receiver<Option<LoadOutcome>>> {
    inner.slots.values().find_map(|slot| match slot {
        Slot::Loading(rx) => Some(rx.clone()),
        _ => None,
    })
}
