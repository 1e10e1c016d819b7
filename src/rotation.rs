//! Endpoint rotation with in-flight draining.
//!
//! The controller keeps the endpoint list and a current index. Requests
//! mark the endpoint they are using through an RAII guard; rotating away
//! from an endpoint waits (bounded) for its in-flight count to reach zero
//! so a rotation does not race requests that are still streaming.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::{Endpoint, RotationConfig};
use crate::error::RotationError;

#[derive(Debug)]
struct RotationState {
    endpoints: Vec<Endpoint>,
    current_index: usize,
}

impl RotationState {
    fn enabled(&self) -> Vec<&Endpoint> {
        self.endpoints.iter().filter(|e| e.enabled).collect()
    }

    fn current(&self) -> Option<&Endpoint> {
        let enabled = self.enabled();
        if enabled.is_empty() {
            return None;
        }
        Some(enabled[self.current_index % enabled.len()])
    }
}

/// Per-endpoint in-flight request counts with a drain notification.
#[derive(Debug, Default)]
pub struct InFlightTracker {
    counts: Mutex<HashMap<String, usize>>,
    drained: Notify,
}

impl InFlightTracker {
    pub fn count(&self, name: &str) -> usize {
        self.counts.lock().get(name).copied().unwrap_or(0)
    }

    fn acquire(&self, name: &str) {
        *self.counts.lock().entry(name.to_string()).or_insert(0) += 1;
    }

    fn release(&self, name: &str) {
        let mut counts = self.counts.lock();
        let Some(count) = counts.get_mut(name) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(name);
            drop(counts);
            self.drained.notify_waiters();
        }
    }
}

/// Marks one request as in flight on an endpoint until dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: Arc<InFlightTracker>,
    name: String,
}

impl InFlightGuard {
    pub fn endpoint(&self) -> &str {
        &self.name
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.release(&self.name);
    }
}

#[derive(Debug)]
pub struct RotationController {
    state: RwLock<RotationState>,
    in_flight: Arc<InFlightTracker>,
    config: RotationConfig,
}

impl RotationController {
    pub fn new(endpoints: Vec<Endpoint>, config: RotationConfig) -> Self {
        Self {
            state: RwLock::new(RotationState {
                endpoints,
                current_index: 0,
            }),
            in_flight: Arc::new(InFlightTracker::default()),
            config,
        }
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// The endpoint new requests should use, or `None` when nothing is enabled.
    pub fn current_endpoint(&self) -> Option<Endpoint> {
        self.state.read().current().cloned()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.state.read().endpoints.clone()
    }

    pub fn enabled_endpoints(&self) -> Vec<Endpoint> {
        self.state.read().enabled().into_iter().cloned().collect()
    }

    pub fn enabled_count(&self) -> usize {
        self.state.read().enabled().len()
    }

    /// Rotate away from the current endpoint.
    pub async fn rotate(&self) -> Option<Endpoint> {
        let current = self.current_endpoint()?;
        self.rotate_from(&current.name).await
    }

    /// Rotate away from `name` if it is still current; otherwise leave the
    /// index alone. Returns the endpoint that is current afterwards.
    pub async fn rotate_from(&self, name: &str) -> Option<Endpoint> {
        let still_current = self
            .current_endpoint()
            .is_some_and(|current| current.name == name);
        if !still_current {
            debug!(endpoint = name, "rotation skipped, endpoint no longer current");
            return self.current_endpoint();
        }

        self.wait_for_drain(name).await;

        let mut state = self.state.write();
        let enabled_len = state.enabled().len();
        if enabled_len == 0 {
            return None;
        }
        if state.current().is_some_and(|current| current.name == name) {
            state.current_index = (state.current_index % enabled_len + 1) % enabled_len;
            let next = state.current().cloned();
            info!(
                from = name,
                to = next.as_ref().map(|e| e.name.as_str()).unwrap_or(""),
                "rotated endpoint"
            );
            return next;
        }
        state.current().cloned()
    }

    /// Wait until `name` has no in-flight requests, bounded by the drain timeout.
    async fn wait_for_drain(&self, name: &str) {
        let started = Instant::now();
        let deadline = started + self.config.drain_timeout();
        loop {
            let notified = self.in_flight.drained.notified();
            let remaining = self.in_flight.count(name);
            if remaining == 0 {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    endpoint = name,
                    in_flight = remaining,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "drain timeout reached, rotating anyway"
                );
                return;
            }
            let wait = self.config.drain_poll().min(deadline - now);
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Jump to a named enabled endpoint. In-flight markers are untouched.
    pub fn set_current_endpoint(&self, name: &str) -> Result<(), RotationError> {
        let mut state = self.state.write();
        let position = state
            .enabled()
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| RotationError::UnknownEndpoint(name.to_string()))?;
        state.current_index = position;
        info!(endpoint = name, "current endpoint set");
        Ok(())
    }

    /// Replace the endpoint list and start again from the first enabled one.
    pub fn update_endpoints(&self, endpoints: Vec<Endpoint>) {
        let mut state = self.state.write();
        info!(count = endpoints.len(), "endpoint list updated");
        state.endpoints = endpoints;
        state.current_index = 0;
    }

    /// Mark a request in flight on `name` until the guard drops.
    pub fn mark_active(&self, name: &str) -> InFlightGuard {
        self.in_flight.acquire(name);
        InFlightGuard {
            tracker: Arc::clone(&self.in_flight),
            name: name.to_string(),
        }
    }

    pub fn in_flight(&self, name: &str) -> usize {
        self.in_flight.count(name)
    }
}
