//! MVCC-visible columnar chunk store.
//!
//! A table holds at most one visible chunk: a columnar image built by a bulk
//! insert and published into a shared segment, optionally mirrored into
//! preserved memory of the GPU the table is pinned on.
//!
//! - [`mvcc`]: transaction ids, snapshots and chunk visibility
//! - [`chunk`]: table keys and chunk records
//! - [`registry`]: the shared chunk slots and their hash buckets
//! - [`table`]: table and column definitions
//! - [`layout`]: the chunk image format
//! - [`staging`]: bulk-insert staging and image building
//! - [`compressor`]: optional zstd compression of column areas
//! - [`view`]: read-only columnar view of an image
//! - [`scan`]: row-by-row scan of a table
//! - [`loader`]: mapping chunks and loading them into GPU contexts
//! - [`access`]: insert, delete, transaction end and introspection

pub mod access;
pub mod chunk;
pub mod compressor;
pub mod layout;
pub mod loader;
pub mod mvcc;
pub mod registry;
pub mod scan;
pub mod staging;
pub mod table;
pub mod view;

pub use chunk::{ChunkInfo, ChunkSlot, Oid, TableKey};
pub use loader::LoadedTable;
pub use mvcc::{CommandId, Snapshot, TransactionId, TransactionOracle};
pub use registry::{ChunkRegistry, RegistryStats};
pub use scan::ChunkScan;
pub use staging::BulkInsert;
pub use table::{ColumnDef, ColumnWidth, TableDef};
pub use view::{ColumnarView, Datum};
