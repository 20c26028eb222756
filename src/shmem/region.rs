//! The shared region.
//!
//! Built once at startup from the capacity settings and handed to every
//! process as an `Arc`. Nothing in it can be resized afterwards.

use std::sync::Arc;

use prometheus::Registry;
use tracing::info;

use super::segment::SegmentManager;
use crate::config::Config;
use crate::context::ContextPool;
use crate::error::Result;
use crate::metrics::StoreMetrics;
use crate::store::registry::ChunkRegistry;

/// Size of the DMA buffer prefaulted through the master context.
const PREFAULT_DMA_LEN: usize = 8192;

#[derive(Debug)]
pub struct SharedRegion {
    config: Config,
    contexts: ContextPool,
    chunks: ChunkRegistry,
    segments: SegmentManager,
    metrics: StoreMetrics,
}

impl SharedRegion {
    pub fn create(config: &Config) -> Result<Arc<Self>> {
        config.validate()?;

        let region = Self {
            config: config.clone(),
            contexts: ContextPool::new(config.pool.num_contexts()),
            chunks: ChunkRegistry::new(config.store.max_relations),
            segments: SegmentManager::new(),
            metrics: StoreMetrics::new()?,
        };

        // The master context holds one DMA buffer for the region's lifetime.
        region
            .contexts
            .master()
            .alloc_dma_buffer(&region.segments, PREFAULT_DMA_LEN);

        info!(
            contexts = region.contexts.capacity(),
            chunk_slots = region.chunks.capacity(),
            "Created shared region"
        );
        Ok(Arc::new(region))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn contexts(&self) -> &ContextPool {
        &self.contexts
    }

    pub fn chunks(&self) -> &ChunkRegistry {
        &self.chunks
    }

    pub fn segments(&self) -> &SegmentManager {
        &self.segments
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// Expose the region's metrics through `registry`.
    pub fn register_metrics(&self, registry: &Registry) -> Result<()> {
        self.metrics.register(registry)?;
        Ok(())
    }
}
