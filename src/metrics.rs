//! Prometheus metrics for the context pool and chunk registry.

use prometheus::{IntCounter, IntGauge, Registry};

/// Handles are cheap clones of the same underlying series.
#[derive(Debug, Clone)]
pub struct StoreMetrics {
    pub contexts_in_use: IntGauge,
    pub chunks_in_use: IntGauge,
    pub chunks_released: IntCounter,
    pub leaked_resources: IntCounter,
    pub protocol_violations: IntCounter,
}

impl StoreMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            contexts_in_use: IntGauge::new(
                "gpustore_contexts_in_use",
                "Shared GPU contexts currently acquired",
            )?,
            chunks_in_use: IntGauge::new(
                "gpustore_chunks_in_use",
                "Chunk slots currently holding a chunk",
            )?,
            chunks_released: IntCounter::new(
                "gpustore_chunks_released_total",
                "Chunks physically released",
            )?,
            leaked_resources: IntCounter::new(
                "gpustore_leaked_resources_total",
                "Tracked GPU resources reclaimed at context teardown",
            )?,
            protocol_violations: IntCounter::new(
                "gpustore_protocol_violations_total",
                "Internal invariant violations observed",
            )?,
        })
    }

    /// Register every series in `registry`.
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.contexts_in_use.clone()))?;
        registry.register(Box::new(self.chunks_in_use.clone()))?;
        registry.register(Box::new(self.chunks_released.clone()))?;
        registry.register(Box::new(self.leaked_resources.clone()))?;
        registry.register(Box::new(self.protocol_violations.clone()))?;
        Ok(())
    }
}
