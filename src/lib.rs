//! gpustore: a process-shared GPU context pool and an MVCC-visible,
//! GPU-resident columnar chunk store.
//!
//! Cooperating processes share one [`shmem::SharedRegion`] holding the
//! context descriptors and the chunk registry. Each process wraps it in a
//! [`process::ProcessState`], through which contexts are acquired and
//! tables are inserted into, scanned, loaded onto GPUs and deleted.

pub mod config;
pub mod context;
pub mod error;
pub mod gpu;
pub mod host;
pub mod metrics;
pub mod process;
pub mod shmem;
pub mod store;

pub use error::{Result, StoreError};
