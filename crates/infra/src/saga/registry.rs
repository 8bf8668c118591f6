//! In-memory saga store.
//!
//! Each saga sits behind its own mutex so mutations are linearized per saga id
//! while operations on different sagas proceed independently. The map-level
//! lock is held only long enough to look up (or insert) the per-saga handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tradeflow_core::{CorrelationId, SagaId};

use super::model::Saga;

type SagaCell = Arc<Mutex<Saga>>;

/// Exclusive owner of all saga aggregates. Reads hand out clones.
#[derive(Debug, Default)]
pub struct SagaRegistry {
    sagas: RwLock<HashMap<SagaId, SagaCell>>,
    correlations: RwLock<HashMap<CorrelationId, SagaId>>,
}

// Every mutation completes before its guard drops, so a poisoned lock still
// guards consistent state.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock(cell: &SagaCell) -> MutexGuard<'_, Saga> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SagaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Take ownership of a new saga and return a snapshot of it.
    ///
    /// A correlation id already bound to another saga is rebound to this one.
    pub fn insert(&self, saga: Saga) -> Saga {
        let snapshot = saga.clone();
        if let Some(correlation_id) = &saga.correlation_id {
            write(&self.correlations).insert(correlation_id.clone(), saga.saga_id);
        }
        write(&self.sagas).insert(saga.saga_id, Arc::new(Mutex::new(saga)));
        snapshot
    }

    fn cell(&self, saga_id: SagaId) -> Option<SagaCell> {
        read(&self.sagas).get(&saga_id).cloned()
    }

    pub fn contains(&self, saga_id: SagaId) -> bool {
        read(&self.sagas).contains_key(&saga_id)
    }

    pub fn snapshot(&self, saga_id: SagaId) -> Option<Saga> {
        self.cell(saga_id).map(|cell| lock(&cell).clone())
    }

    /// Run `f` against the live saga while holding its lock.
    ///
    /// Returns `None` if the id is unknown. `f` must not call back into the
    /// registry for the same saga.
    pub fn update<R>(&self, saga_id: SagaId, f: impl FnOnce(&mut Saga) -> R) -> Option<R> {
        let cell = self.cell(saga_id)?;
        let mut saga = lock(&cell);
        Some(f(&mut saga))
    }

    pub fn saga_id_for(&self, correlation_id: &CorrelationId) -> Option<SagaId> {
        read(&self.correlations).get(correlation_id).copied()
    }

    pub fn find_by_correlation_id(&self, correlation_id: &CorrelationId) -> Option<Saga> {
        self.saga_id_for(correlation_id)
            .and_then(|saga_id| self.snapshot(saga_id))
    }

    /// Snapshots of every saga matching `predicate`, oldest first.
    pub fn snapshots(&self, predicate: impl Fn(&Saga) -> bool) -> Vec<Saga> {
        let cells: Vec<SagaCell> = read(&self.sagas).values().cloned().collect();
        let mut result: Vec<Saga> = cells
            .iter()
            .map(|cell| lock(cell).clone())
            .filter(|saga| predicate(saga))
            .collect();
        result.sort_by_key(|s| (s.started_at, s.saga_id));
        result
    }

    pub fn len(&self) -> usize {
        read(&self.sagas).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every saga and correlation binding.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut sagas = write(&self.sagas);
            let n = sagas.len();
            sagas.clear();
            n
        };
        write(&self.correlations).clear();
        removed
    }
}
