// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process selection strategies.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fleetplane_core::CoreError;
use fleetplane_core::persistence::{Persistence, ProcessRecord};
use tokio::sync::Mutex;

/// Chooses the process a session should be routed to.
///
/// A pick is a hint. The dispatch itself re-checks capacity atomically, so a
/// picker working from a stale view only costs a retry next round.
#[async_trait]
pub trait Picker: Send + Sync {
    /// Candidate process in `fleet_id`, or `None` if nothing has room.
    async fn pick(&self, fleet_id: &str) -> Result<Option<ProcessRecord>, CoreError>;

    /// Forget what is known about one fleet, e.g. after a lost dispatch.
    async fn invalidate(&self, fleet_id: &str);

    /// Forget everything.
    async fn clear_cache(&self);
}

/// Packs sessions onto the busiest process that still has room.
///
/// The fleet's process list is cached and the picker counts its own picks
/// against it, so concurrent picks within one round spread over capacity
/// instead of all landing on the same process.
pub struct BusiestFirstPicker {
    persistence: Arc<dyn Persistence>,
    cache: Mutex<HashMap<String, Vec<ProcessRecord>>>,
}

impl BusiestFirstPicker {
    /// Create a busiest-first picker.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Number of fleets with a cached process list.
    pub async fn cached_fleets(&self) -> usize {
        self.cache.lock().await.len()
    }
}

fn busiest(processes: &mut [ProcessRecord]) -> Option<&mut ProcessRecord> {
    processes
        .iter_mut()
        .filter(|p| p.free_slots() > 0)
        .max_by(|a, b| {
            a.current_sessions
                .cmp(&b.current_sessions)
                .then_with(|| b.process_id.cmp(&a.process_id))
        })
}

#[async_trait]
impl Picker for BusiestFirstPicker {
    async fn pick(&self, fleet_id: &str) -> Result<Option<ProcessRecord>, CoreError> {
        let mut cache = self.cache.lock().await;

        let exhausted = cache
            .get(fleet_id)
            .is_none_or(|processes| processes.iter().all(|p| p.free_slots() == 0));
        if exhausted {
            let fresh = self.persistence.list_available_processes(fleet_id).await?;
            cache.insert(fleet_id.to_string(), fresh);
        }

        let Some(processes) = cache.get_mut(fleet_id) else {
            return Ok(None);
        };
        Ok(busiest(processes).map(|process| {
            process.current_sessions += 1;
            let mut picked = process.clone();
            picked.current_sessions -= 1;
            picked
        }))
    }

    async fn invalidate(&self, fleet_id: &str) {
        self.cache.lock().await.remove(fleet_id);
    }

    async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }
}

/// Rotates through a fleet's processes that have room.
pub struct RoundRobinPicker {
    persistence: Arc<dyn Persistence>,
    cursors: Mutex<HashMap<String, usize>>,
}

impl RoundRobinPicker {
    /// Create a round-robin picker.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence,
            cursors: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Picker for RoundRobinPicker {
    async fn pick(&self, fleet_id: &str) -> Result<Option<ProcessRecord>, CoreError> {
        let mut processes = self.persistence.list_available_processes(fleet_id).await?;
        if processes.is_empty() {
            return Ok(None);
        }
        processes.sort_by(|a, b| a.process_id.cmp(&b.process_id));

        let mut cursors = self.cursors.lock().await;
        let cursor = cursors.entry(fleet_id.to_string()).or_insert(0);
        let picked = processes.swap_remove(*cursor % processes.len());
        *cursor = cursor.wrapping_add(1);
        Ok(Some(picked))
    }

    async fn invalidate(&self, fleet_id: &str) {
        self.cursors.lock().await.remove(fleet_id);
    }

    async fn clear_cache(&self) {
        self.cursors.lock().await.clear();
    }
}
