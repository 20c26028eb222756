//! Shared memory.
//!
//! - [`segment`]: dynamically created shared segments (chunk images, DMA buffers)
//! - [`region`]: the fixed region holding the context pool and chunk registry

pub mod region;
pub mod segment;

pub use region::SharedRegion;
pub use segment::{Mapping, SegmentHandle, SegmentManager};
