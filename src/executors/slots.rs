// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 mriflow contributors

//! Per-tool concurrency slots
//!
//! Some tools are licensed per machine. Their invocations are serialized
//! process-wide, across every subject, by a named semaphore.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::{CancellationToken, ToolRegistry};
use crate::pipeline::StageFailure;

/// Named semaphores, one per slot-limited tool
#[derive(Debug, Clone, Default)]
pub struct ToolSlots {
    semaphores: HashMap<String, Arc<Semaphore>>,
}

impl ToolSlots {
    /// No limits
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Limits declared in the registry
    pub fn from_registry(registry: &ToolRegistry) -> Self {
        let mut slots = Self::default();
        for (name, entry) in registry.tools() {
            if let Some(limit) = entry.slots {
                slots = slots.with_limit(name, limit);
            }
        }
        slots
    }

    /// Limit `tool` to `limit` concurrent invocations
    pub fn with_limit(mut self, tool: &str, limit: usize) -> Self {
        self.semaphores
            .insert(tool.to_string(), Arc::new(Semaphore::new(limit.max(1))));
        self
    }

    /// Wait for a slot. Returns `Ok(None)` for tools without a limit.
    ///
    /// The permit is released when dropped, on success and failure alike.
    /// Cancellation while queued gives up the wait.
    pub async fn acquire(
        &self,
        tool: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<OwnedSemaphorePermit>, StageFailure> {
        let Some(semaphore) = self.semaphores.get(tool) else {
            return Ok(None);
        };
        debug!(tool, available = semaphore.available_permits(), "waiting for tool slot");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StageFailure::Cancelled),
            // The semaphores are never closed
            permit = semaphore.clone().acquire_owned() => Ok(permit.ok()),
        }
    }

    /// Whether `tool` has a concurrency limit
    pub fn is_limited(&self, tool: &str) -> bool {
        self.semaphores.contains_key(tool)
    }
}
