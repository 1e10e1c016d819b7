//! ccg-rust: a protocol-translating failover gateway.
//!
//! Clients speak the Claude Messages API (or OpenAI Chat); each request is
//! converted to the protocol of the current backend endpoint, forwarded,
//! converted back, and retried across endpoints on failure.

pub mod config;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod rotation;
pub mod router;
pub mod sse;
pub mod stats;
pub mod tokens;
pub mod transform;
pub mod transformer;

use anyhow::Result;
use axum::Router;
use std::sync::Arc;

use crate::config::{validate_endpoints, Config, Endpoint};
use crate::error::RotationError;
use crate::router::AppState;
use crate::stats::{StatsCollector, StatsSnapshot, StatsStorage};

/// Embedding façade: owns the shared state behind the HTTP surface and
/// exposes the operations a host application drives directly.
#[derive(Clone)]
pub struct Gateway {
    state: AppState,
}

impl Gateway {
    /// Build a gateway; stats are persisted to `storage` when given and
    /// seeded from it.
    pub fn new(config: Config, storage: Option<Arc<dyn StatsStorage>>) -> Result<Self> {
        let stats = Arc::new(StatsCollector::new(storage)?);
        stats.restore()?;
        Ok(Self {
            state: AppState::new(config, stats),
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        router::build_router(self.state.clone())
    }

    /// Replace the endpoint list. Rotation restarts from the first enabled
    /// endpoint; requests already in flight finish on their endpoint.
    pub fn update_config(&self, endpoints: Vec<Endpoint>) -> Result<()> {
        validate_endpoints(&endpoints)?;
        self.state.rotation.update_endpoints(endpoints);
        Ok(())
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.state.stats.snapshot()
    }

    pub fn current_endpoint_name(&self) -> Option<String> {
        self.state.rotation.current_endpoint().map(|e| e.name)
    }

    pub fn set_current_endpoint(&self, name: &str) -> Result<(), RotationError> {
        self.state.rotation.set_current_endpoint(name)
    }

    /// Push pending daily stats to storage.
    pub fn flush_stats(&self) -> Result<usize> {
        self.state.stats.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::stats::MemoryStatsStorage;

    fn gateway() -> Gateway {
        let config = Config::from_json_str(
            r#"{"Endpoints": [
                {"name": "a", "base_url": "http://127.0.0.1:1"},
                {"name": "b", "base_url": "http://127.0.0.1:2", "protocol": "gemini", "model": "gemini-2.5-pro"}
            ]}"#,
        )
        .unwrap();
        Gateway::new(config, Some(Arc::new(MemoryStatsStorage::new()))).unwrap()
    }

    #[test]
    fn test_current_endpoint_switching() {
        let gw = gateway();
        assert_eq!(gw.current_endpoint_name().as_deref(), Some("a"));
        gw.set_current_endpoint("b").unwrap();
        assert_eq!(gw.current_endpoint_name().as_deref(), Some("b"));
        assert!(gw.set_current_endpoint("missing").is_err());
    }

    #[test]
    fn test_update_config_replaces_endpoints() {
        let gw = gateway();
        gw.set_current_endpoint("b").unwrap();
        gw.update_config(vec![Endpoint::new("c", "http://x", "k", Protocol::OpenaiChat)])
            .unwrap();
        assert_eq!(gw.current_endpoint_name().as_deref(), Some("c"));

        let duplicate = vec![
            Endpoint::new("d", "http://x", "k", Protocol::Native),
            Endpoint::new("d", "http://y", "k", Protocol::Native),
        ];
        assert!(gw.update_config(duplicate).is_err());
        assert_eq!(gw.current_endpoint_name().as_deref(), Some("c"));
    }

    #[test]
    fn test_empty_update_leaves_no_current_endpoint() {
        let gw = gateway();
        gw.update_config(Vec::new()).unwrap();
        assert_eq!(gw.current_endpoint_name(), None);
    }

    #[test]
    fn test_stats_start_empty() {
        let gw = gateway();
        let snapshot = gw.get_stats();
        assert_eq!(snapshot.total_requests, 0);
        assert!(snapshot.endpoints.is_empty());
        assert_eq!(gw.flush_stats().unwrap(), 0);
    }
}
