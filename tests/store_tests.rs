//! End-to-end tests of the chunk store: insert, scan, GPU loading and
//! reclamation.

use std::io::Write;
use std::sync::Arc;

use gpustore::config::{ColumnOptions, Compression, Config, Pinning, TableOptions};
use gpustore::gpu::device::simulated_devices;
use gpustore::gpu::SimulatedDriver;
use gpustore::host::{Session, TransactionManager};
use gpustore::process::{ProcessId, ProcessRole, ProcessState, ResourceScopeId};
use gpustore::shmem::SharedRegion;
use gpustore::store::{ChunkScan, ColumnDef, Datum, TableDef, TableKey};
use gpustore::StoreError;

struct Fixture {
    region: Arc<SharedRegion>,
    driver: Arc<SimulatedDriver>,
    process: ProcessState,
    manager: Arc<TransactionManager>,
}

impl Fixture {
    fn new(max_relations: usize) -> Self {
        let mut config = Config::default();
        config.store.max_relations = max_relations;
        config.store.initial_rows = 8;
        let driver = Arc::new(SimulatedDriver::new(&simulated_devices(&config.devices)));
        let region = SharedRegion::create(&config).unwrap();
        let process = ProcessState::new(
            ProcessId(1),
            ProcessRole::Client,
            Arc::clone(&region),
            driver.clone(),
            None,
        );
        Self {
            region,
            driver,
            process,
            manager: TransactionManager::new(),
        }
    }

    fn peer(&self, pid: u32) -> ProcessState {
        ProcessState::new(
            ProcessId(pid),
            ProcessRole::Client,
            Arc::clone(&self.region),
            self.driver.clone(),
            None,
        )
    }

    /// Load `rows` rows of (id, label) and commit.
    fn load(&self, table: &TableDef, rows: i64) {
        let txn = self.manager.begin();
        let mut bulk = self
            .process
            .begin_insert(table, &txn.snapshot(), &txn)
            .unwrap();
        for i in 0..rows {
            let label = format!("row-{}", i % 5);
            let label = (i % 7 != 0).then_some(label.as_bytes().to_vec());
            bulk.insert_row(&[Some(&i.to_le_bytes()), label.as_deref()])
                .unwrap();
        }
        self.process.finish_insert(bulk, &txn).unwrap();
        self.commit(&txn);
    }

    fn commit(&self, txn: &Session) -> usize {
        txn.commit();
        self.process
            .on_transaction_end(true, txn, self.manager.oldest_xmin())
    }
}

fn table(id: u32, pinning: Pinning) -> TableDef {
    TableDef::new(
        TableKey::new(1, id),
        TableOptions {
            pinning,
            ..TableOptions::default()
        },
        vec![
            ColumnDef::fixed("id", 8),
            ColumnDef::variable("label").with_options(ColumnOptions {
                compression: Compression::Zstd,
            }),
        ],
    )
}

#[test]
fn test_scan_returns_inserted_rows() {
    let f = Fixture::new(4);
    let t = table(100, Pinning::Unpinned);
    f.load(&t, 50);

    let txn = f.manager.begin();
    let mut scan = ChunkScan::new(&f.process, t.key, txn.snapshot(), &txn);
    let mut seen = 0;
    while let Some(row) = scan.next_row().unwrap() {
        let i = seen as i64;
        assert_eq!(row[0].as_i64(), Some(i));
        if i % 7 == 0 {
            assert_eq!(row[1], Datum::Null);
        } else {
            assert_eq!(row[1].bytes(), Some(format!("row-{}", i % 5).as_bytes()));
        }
        seen += 1;
    }
    assert_eq!(seen, 50);
    assert!(scan.next_row().unwrap().is_none());

    scan.rescan();
    assert_eq!(scan.next_row().unwrap().unwrap()[0].as_i64(), Some(0));
    assert_eq!(scan.position(), 1);
}

#[test]
fn test_other_process_maps_published_chunk() {
    let f = Fixture::new(4);
    let t = table(100, Pinning::Unpinned);
    f.load(&t, 20);

    let peer = f.peer(2);
    assert_eq!(peer.mapped_chunks(), 0);
    let txn = f.manager.begin();
    let mut scan = ChunkScan::new(&peer, t.key, txn.snapshot(), &txn);
    let mut rows = 0;
    while scan.next_row().unwrap().is_some() {
        rows += 1;
    }
    assert_eq!(rows, 20);
    assert_eq!(peer.mapped_chunks(), 1);
}

#[test]
fn test_empty_table_scans_nothing_and_reports_zero() {
    let f = Fixture::new(4);
    let t = table(100, Pinning::Unpinned);
    let txn = f.manager.begin();

    let mut scan = ChunkScan::new(&f.process, t.key, txn.snapshot(), &txn);
    assert!(scan.next_row().unwrap().is_none());
    assert_eq!(f.process.table_height(&t, &txn.snapshot(), &txn).unwrap(), 0);
    assert_eq!(f.process.table_rawsize(&t, &txn.snapshot(), &txn).unwrap(), 0);
    assert_eq!(f.process.delete_all(&t, &txn.snapshot(), &txn).unwrap(), 0);
    assert_eq!(f.process.table_format(&t), "pgstrom");
    assert_eq!(f.process.table_width(&t), 2);
}

#[test]
fn test_empty_insert_publishes_nothing() {
    let f = Fixture::new(4);
    let t = table(100, Pinning::Device(0));
    let txn = f.manager.begin();
    let bulk = f.process.begin_insert(&t, &txn.snapshot(), &txn).unwrap();
    assert!(bulk.context().is_some());

    assert_eq!(f.process.finish_insert(bulk, &txn).unwrap(), None);
    assert_eq!(f.region.chunks().stats().active, 0);
    assert_eq!(f.driver.stats().preserved_allocations, 0);
    assert_eq!(f.process.active_contexts(), 0);
}

#[test]
fn test_unpinned_load_copies_into_managed_memory() {
    let f = Fixture::new(4);
    let t = table(100, Pinning::Unpinned);
    f.load(&t, 30);

    let txn = f.manager.begin();
    let snapshot = txn.snapshot();
    let rawsize = f.process.table_rawsize(&t, &snapshot, &txn).unwrap();
    let ctx = f.process.acquire_context(false).unwrap();
    let loaded = f.process.load_table(&ctx, &t, &snapshot, &txn).unwrap();

    let ptr = loaded.ptr.unwrap();
    assert_eq!(loaded.length, rawsize);
    assert_eq!(f.driver.read_device(ptr).unwrap().len(), rawsize);
    assert_eq!(&f.driver.read_device(ptr).unwrap()[..4], b"GSTR");
    assert_eq!(ctx.tracked_resources(), 1);

    f.process.unload_table(&ctx, &loaded).unwrap();
    assert_eq!(f.driver.stats().managed_allocations, 0);
    f.process.release(&ctx).unwrap();
}

#[test]
fn test_pinned_chunk_is_exported_and_mapped() {
    let f = Fixture::new(4);
    let t = table(200, Pinning::Device(1));
    f.load(&t, 10);
    assert_eq!(f.driver.stats().preserved_allocations, 1);
    assert!(f.driver.device_bytes(1) > 0);

    let txn = f.manager.begin();
    let snapshot = txn.snapshot();
    let handle = f.process.export_ipc_handle(&t, &snapshot, &txn).unwrap().unwrap();
    assert!(!handle.is_zero());

    let ctx = f.process.acquire_context_on(1, false).unwrap();
    let loaded = f.process.load_table(&ctx, &t, &snapshot, &txn).unwrap();
    let image = f.driver.read_device(loaded.ptr.unwrap()).unwrap();
    assert_eq!(&image[..4], b"GSTR");
    assert_eq!(f.driver.stats().open_ipc_mappings, 1);

    // Leaving the mapping to the scope cleanup closes it.
    drop(loaded);
    drop(ctx);
    f.process.on_resource_scope_end(false);
    assert_eq!(f.driver.stats().open_ipc_mappings, 0);
    assert_eq!(f.driver.stats().preserved_allocations, 1);
}

#[test]
fn test_export_requires_pinning() {
    let f = Fixture::new(4);
    let txn = f.manager.begin();
    let unpinned = table(100, Pinning::Unpinned);
    let err = f
        .process
        .export_ipc_handle(&unpinned, &txn.snapshot(), &txn)
        .unwrap_err();
    assert!(matches!(err, StoreError::NotPinned(_)));

    let empty = table(101, Pinning::Device(0));
    assert!(f
        .process
        .export_ipc_handle(&empty, &txn.snapshot(), &txn)
        .unwrap()
        .is_none());
}

#[test]
fn test_load_on_wrong_device_allocates_nothing() {
    let f = Fixture::new(4);
    let t = table(200, Pinning::Device(1));
    f.load(&t, 10);
    let before = f.driver.stats();
    let bytes_before = f.driver.device_bytes(0);

    let txn = f.manager.begin();
    let ctx = f.process.acquire_context_on(0, false).unwrap();
    let err = f
        .process
        .load_table(&ctx, &t, &txn.snapshot(), &txn)
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::DeviceMismatch { pinned: 1, context: Some(0), .. }
    ));
    assert_eq!(f.driver.stats(), before);
    assert_eq!(f.driver.device_bytes(0), bytes_before);
    assert_eq!(ctx.tracked_resources(), 0);

    // An unbound context does not match either.
    let unbound = f.process.acquire_context(false).unwrap();
    assert!(f
        .process
        .load_table(&unbound, &t, &txn.snapshot(), &txn)
        .is_err());
    assert_eq!(f.driver.stats(), before);
}

#[test]
fn test_preferable_device_and_multi_table_load() {
    let f = Fixture::new(4);
    let plain = table(100, Pinning::Unpinned);
    let on1 = table(200, Pinning::Device(1));
    let also_on1 = table(201, Pinning::Device(1));
    let on0 = table(300, Pinning::Device(0));
    f.load(&plain, 5);
    f.load(&on1, 5);

    assert_eq!(f.process.preferable_device(&[&plain]).unwrap(), None);
    assert_eq!(
        f.process.preferable_device(&[&plain, &on1, &also_on1]).unwrap(),
        Some(1)
    );
    assert!(matches!(
        f.process.preferable_device(&[&on1, &on0]).unwrap_err(),
        StoreError::DeviceMismatch { .. }
    ));

    let txn = f.manager.begin();
    let ctx = f.process.acquire_context_on(1, false).unwrap();
    let loaded = f
        .process
        .load_tables(&ctx, &[&plain, &on1, &plain, &also_on1], &txn.snapshot(), &txn)
        .unwrap();
    assert_eq!(loaded.len(), 3);
    assert!(loaded[0].ptr.is_some());
    assert!(loaded[1].ptr.is_some());
    assert!(loaded[2].ptr.is_none());
    assert_eq!(ctx.tracked_resources(), 2);

    // A failing table unloads the ones before it.
    let err = f
        .process
        .load_tables(&ctx, &[&plain, &on0], &txn.snapshot(), &txn)
        .unwrap_err();
    assert!(matches!(err, StoreError::DeviceMismatch { .. }));
    assert_eq!(ctx.tracked_resources(), 2);

    for l in &loaded {
        f.process.unload_table(&ctx, l).unwrap();
    }
    assert_eq!(ctx.tracked_resources(), 0);
    assert_eq!(f.driver.stats().managed_allocations, 0);
    assert_eq!(f.driver.stats().open_ipc_mappings, 0);
}

#[test]
fn test_slot_exhaustion_frees_preserved_memory() {
    let f = Fixture::new(1);
    f.load(&table(100, Pinning::Device(0)), 3);
    let segments = f.region.segments().live_count();

    let txn = f.manager.begin();
    let t = table(101, Pinning::Device(0));
    let mut bulk = f.process.begin_insert(&t, &txn.snapshot(), &txn).unwrap();
    bulk.insert_row(&[Some(&1i64.to_le_bytes()), None]).unwrap();
    let err = f.process.finish_insert(bulk, &txn).unwrap_err();

    assert!(matches!(err, StoreError::ResourceExhausted { capacity: 1, .. }));
    assert_eq!(f.driver.stats().preserved_allocations, 1);
    assert_eq!(f.region.segments().live_count(), segments);
    assert_eq!(f.process.active_contexts(), 0);
}

#[test]
fn test_delete_commit_frees_everything() {
    let f = Fixture::new(4);
    let pinned = table(200, Pinning::Device(0));
    let plain = table(100, Pinning::Unpinned);
    f.load(&pinned, 10);
    f.load(&plain, 10);
    assert_eq!(f.region.metrics().chunks_in_use.get(), 2);
    let segments = f.region.segments().live_count();

    let txn = f.manager.begin();
    assert_eq!(f.process.delete_all(&pinned, &txn.snapshot(), &txn).unwrap(), 10);
    assert_eq!(f.process.delete_all(&plain, &txn.snapshot(), &txn).unwrap(), 10);
    assert_eq!(f.commit(&txn), 2);

    assert_eq!(f.region.chunks().stats().active, 0);
    assert_eq!(f.region.segments().live_count(), segments - 2);
    assert_eq!(f.driver.stats().preserved_allocations, 0);
    assert_eq!(f.driver.device_bytes(0), 0);
    assert_eq!(f.process.mapped_chunks(), 0);
    assert_eq!(f.region.metrics().chunks_in_use.get(), 0);
    assert_eq!(f.region.metrics().chunks_released.get(), 2);
}

#[test]
fn test_scope_commit_reports_unloaded_memory_as_leak() {
    let f = Fixture::new(4);
    let t = table(100, Pinning::Unpinned);
    f.load(&t, 4);

    f.process.set_resource_scope(ResourceScopeId(9));
    let txn = f.manager.begin();
    let ctx = f.process.acquire_context(false).unwrap();
    f.process.load_table(&ctx, &t, &txn.snapshot(), &txn).unwrap();
    drop(ctx);

    assert_eq!(f.process.on_resource_scope_end(true), 1);
    assert_eq!(f.driver.stats().managed_allocations, 0);
    assert_eq!(f.region.metrics().leaked_resources.get(), 1);
}

#[test]
fn test_config_file_sizes_region() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{"store": {{"max_relations": 3}}, "pool": {{"max_connections": 2, "max_worker_processes": 0, "headroom": 1}}}}"#
    )
    .unwrap();

    let config = Config::load(file.path()).unwrap();
    let region = SharedRegion::create(&config).unwrap();
    assert_eq!(region.chunks().capacity(), 3);
    assert_eq!(region.contexts().capacity(), 3);
    assert_eq!(region.config().store.initial_rows, 10_000);
}
