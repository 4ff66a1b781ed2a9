//! Accelerator pool: one warm model replica per device.
//!
//! Each accelerator carries its own exclusivity lock and load counter. There
//! is no pool-wide lock around execution, so work on distinct accelerators
//! never contends.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use candle_core::Device;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use crate::backends::{RenderBackend, Replica, ReplicaLoader};
use crate::error::{Error, Result};

/// Result of loading one accelerator's replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum InitOutcome {
    #[serde(rename_all = "camelCase")]
    Ready { free_memory: u64 },
    Failed { reason: String },
}

/// Per-accelerator outcome of [`AcceleratorPool::initialize`], in request order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InitReport {
    pub outcomes: Vec<(usize, InitOutcome)>,
}

impl InitReport {
    pub fn ready_ids(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, InitOutcome::Ready { .. }))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn failed_ids(&self) -> Vec<usize> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, InitOutcome::Failed { .. }))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Some, but not all, accelerators came up.
    pub fn is_partial(&self) -> bool {
        !self.ready_ids().is_empty() && !self.failed_ids().is_empty()
    }
}

struct AcceleratorState {
    id: usize,
    replica: Replica,
    load: Arc<AtomicUsize>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

/// Live view of one accelerator, as reported by `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceleratorSnapshot {
    pub id: usize,
    pub load: usize,
    pub free_memory: u64,
}

pub struct AcceleratorPool {
    /// Sorted by id
    accelerators: Vec<AcceleratorState>,
    assign: Mutex<()>,
    acquire_timeout: Duration,
    released: AtomicBool,
}

impl AcceleratorPool {
    /// Load one replica per requested accelerator, one after another.
    ///
    /// Accelerators that fail to load are dropped from the ready set. Fails
    /// with [`Error::NoAcceleratorAvailable`] when none load.
    pub async fn initialize(
        ids: &[usize],
        loader: Arc<dyn ReplicaLoader>,
        acquire_timeout: Duration,
    ) -> Result<(Self, InitReport)> {
        let mut seen = HashSet::new();
        let mut report = InitReport::default();
        let mut accelerators = Vec::new();

        for &id in ids.iter().filter(|id| seen.insert(**id)) {
            let started = Instant::now();
            let loader = loader.clone();
            let loaded = tokio::task::spawn_blocking(move || loader.load(id))
                .await
                .map_err(|e| Error::AcceleratorUnavailable(format!("load task failed: {e}")))
                .and_then(|result| result);

            match loaded {
                Ok(replica) => {
                    let free_memory = replica.backend.free_memory();
                    info!(
                        "Accelerator {} ready in {:.2}s ({} MiB free)",
                        id,
                        started.elapsed().as_secs_f32(),
                        free_memory / (1024 * 1024)
                    );
                    report.outcomes.push((id, InitOutcome::Ready { free_memory }));
                    accelerators.push(AcceleratorState {
                        id,
                        replica,
                        load: Arc::new(AtomicUsize::new(0)),
                        lock: Arc::new(tokio::sync::Mutex::new(())),
                    });
                }
                Err(e) => {
                    warn!("Accelerator {} failed to initialize: {}", id, e);
                    report.outcomes.push((
                        id,
                        InitOutcome::Failed {
                            reason: e.to_string(),
                        },
                    ));
                }
            }
        }

        if accelerators.is_empty() {
            error!("No accelerator initialized (requested {:?})", ids);
            return Err(Error::NoAcceleratorAvailable);
        }
        accelerators.sort_by_key(|state| state.id);

        Ok((
            Self {
                accelerators,
                assign: Mutex::new(()),
                acquire_timeout,
                released: AtomicBool::new(false),
            },
            report,
        ))
    }

    pub fn ids(&self) -> Vec<usize> {
        self.accelerators.iter().map(|state| state.id).collect()
    }

    pub fn len(&self) -> usize {
        self.accelerators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accelerators.is_empty()
    }

    fn state(&self, id: usize) -> Result<&AcceleratorState> {
        self.accelerators
            .iter()
            .find(|state| state.id == id)
            .ok_or_else(|| Error::AcceleratorUnavailable(format!("accelerator {id} is not ready")))
    }

    /// Exclusive access to one accelerator's replica, released when the
    /// guard drops.
    pub async fn acquire(&self, id: usize) -> Result<AcceleratorGuard> {
        if self.released.load(Ordering::SeqCst) {
            return Err(Error::AcceleratorUnavailable(format!(
                "accelerator {id} was released"
            )));
        }
        let state = self.state(id)?;
        let permit = tokio::time::timeout(self.acquire_timeout, state.lock.clone().lock_owned())
            .await
            .map_err(|_| {
                Error::AcceleratorUnavailable(format!(
                    "accelerator {id} stayed busy for {:?}",
                    self.acquire_timeout
                ))
            })?;
        Ok(AcceleratorGuard {
            id,
            replica: state.replica.clone(),
            _permit: permit,
        })
    }

    pub fn free_memory(&self, id: usize) -> Result<u64> {
        Ok(self.state(id)?.replica.backend.free_memory())
    }

    /// Smallest free-memory estimate across the ready set.
    pub fn min_free_memory(&self) -> u64 {
        self.accelerators
            .iter()
            .map(|state| state.replica.backend.free_memory())
            .min()
            .unwrap_or(0)
    }

    /// Id with the lowest load; ties go to the lowest id.
    pub fn pick_least_loaded(&self) -> usize {
        self.accelerators
            .iter()
            .min_by_key(|state| (state.load.load(Ordering::SeqCst), state.id))
            .map(|state| state.id)
            .unwrap_or_default()
    }

    /// Pick the least-loaded accelerator and count one unit of load against
    /// it until the returned ticket drops.
    pub fn assign_least_loaded(&self) -> LoadTicket {
        let _assign = self.assign.lock().unwrap_or_else(|e| e.into_inner());
        let id = self.pick_least_loaded();
        let load = self
            .accelerators
            .iter()
            .find(|state| state.id == id)
            .map(|state| state.load.clone())
            .unwrap_or_else(|| Arc::new(AtomicUsize::new(0)));
        load.fetch_add(1, Ordering::SeqCst);
        LoadTicket {
            accelerator: id,
            load,
        }
    }

    pub fn load(&self, id: usize) -> usize {
        self.state(id)
            .map(|state| state.load.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn total_load(&self) -> usize {
        self.accelerators
            .iter()
            .map(|state| state.load.load(Ordering::SeqCst))
            .sum()
    }

    pub fn snapshot(&self) -> Vec<AcceleratorSnapshot> {
        self.accelerators
            .iter()
            .map(|state| AcceleratorSnapshot {
                id: state.id,
                load: state.load.load(Ordering::SeqCst),
                free_memory: state.replica.backend.free_memory(),
            })
            .collect()
    }

    /// Release every replica. Later `acquire` calls fail.
    pub fn shutdown(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for state in &self.accelerators {
            debug!("Releasing accelerator {}", state.id);
            state.replica.backend.release();
        }
        info!("Released {} accelerator(s)", self.accelerators.len());
    }
}

/// Scoped exclusive access to one replica.
pub struct AcceleratorGuard {
    id: usize,
    replica: Replica,
    _permit: OwnedMutexGuard<()>,
}

impl AcceleratorGuard {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn device(&self) -> &Device {
        &self.replica.device
    }

    pub fn backend(&self) -> &dyn RenderBackend {
        self.replica.backend.as_ref()
    }
}

/// One unit of load on an accelerator, returned when dropped.
#[derive(Debug)]
pub struct LoadTicket {
    accelerator: usize,
    load: Arc<AtomicUsize>,
}

impl LoadTicket {
    pub fn accelerator(&self) -> usize {
        self.accelerator
    }
}

impl Drop for LoadTicket {
    fn drop(&mut self) {
        self.load.fetch_sub(1, Ordering::SeqCst);
    }
}
