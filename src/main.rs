//! gpustore demo: builds a shared region, bulk-loads a pinned and an
//! unpinned table, loads both onto the GPU, then deletes them and lets the
//! commit hook reclaim the chunks.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::info;

use gpustore::config::{Cli, ColumnOptions, Compression, Config, Pinning, TableOptions};
use gpustore::gpu::device::detect_devices;
use gpustore::gpu::SimulatedDriver;
use gpustore::host::TransactionManager;
use gpustore::process::{ProcessId, ProcessRole, ProcessState};
use gpustore::shmem::SharedRegion;
use gpustore::store::{ColumnDef, TableDef, TableKey};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "gpustore=debug"
    } else {
        "gpustore=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("gpustore v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.config)?;
    info!(
        contexts = config.pool.num_contexts(),
        chunk_slots = config.store.max_relations,
        "Configuration loaded"
    );

    let devices = detect_devices(&config.devices);
    for dev in &devices {
        info!(
            id = dev.id,
            name = %dev.name,
            vram_mb = dev.total_vram / (1024 * 1024),
            simulated = dev.simulated,
            "GPU device"
        );
    }
    let driver = Arc::new(SimulatedDriver::new(&devices));

    let registry = Registry::new();
    let region = SharedRegion::create(&config)?;
    region.register_metrics(&registry)?;

    let process = ProcessState::new(
        ProcessId(std::process::id()),
        ProcessRole::Client,
        Arc::clone(&region),
        driver.clone(),
        None,
    );
    let manager = TransactionManager::new();

    let zstd = ColumnOptions {
        compression: Compression::Zstd,
    };
    let columns = vec![
        ColumnDef::fixed("id", 8),
        ColumnDef::variable("label").with_options(zstd),
    ];
    let unpinned = TableDef::new(TableKey::new(1, 16384), TableOptions::default(), columns.clone());
    let pinned_options = TableOptions {
        pinning: if devices.is_empty() {
            Pinning::Unpinned
        } else {
            Pinning::Device(0)
        },
        ..TableOptions::default()
    };
    let pinned = TableDef::new(TableKey::new(1, 16385), pinned_options, columns);

    // Load both tables in one transaction.
    let start = Instant::now();
    let txn = manager.begin();
    for table in [&unpinned, &pinned] {
        let mut insert = process.begin_insert(table, &txn.snapshot(), &txn)?;
        for i in 0..cli.rows as i64 {
            let label = format!("label-{}", i % 16);
            insert.insert_row(&[Some(&i.to_le_bytes()), Some(label.as_bytes())])?;
        }
        process.finish_insert(insert, &txn)?;
        txn.next_command();
    }
    txn.commit();
    process.on_transaction_end(true, &txn, manager.oldest_xmin());
    drop(txn);
    info!(
        rows = cli.rows,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Bulk load complete"
    );

    // Load onto the preferred device and report sizes.
    let txn = manager.begin();
    let snapshot = txn.snapshot();
    let tables = [&unpinned, &pinned];
    let ctx = match process.preferable_device(&tables)? {
        Some(device) => process.acquire_context_on(device, false)?,
        None => process.acquire_context(false)?,
    };
    let loaded = process.load_tables(&ctx, &tables, &snapshot, &txn)?;
    for (table, l) in tables.iter().zip(&loaded) {
        info!(
            table = %table.key,
            height = process.table_height(table, &snapshot, &txn)?,
            rawsize = process.table_rawsize(table, &snapshot, &txn)?,
            format = process.table_format(table),
            ptr = ?l.ptr,
            "Table loaded"
        );
    }
    for (device, used) in driver.vram_utilization() {
        info!(device, utilization = used, "VRAM after load");
    }
    for l in &loaded {
        process.unload_table(&ctx, l)?;
    }
    process.release(&ctx)?;

    // Delete everything and let the commit reclaim the chunks.
    for table in tables {
        let rows = process.delete_all(table, &snapshot, &txn)?;
        info!(table = %table.key, rows, "Deleted table");
    }
    txn.commit();
    let released = process.on_transaction_end(true, &txn, manager.oldest_xmin());
    info!(released, "Transaction committed");
    drop(txn);

    process.on_resource_scope_end(true);
    process.on_process_exit()?;

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    info!(driver = ?driver.stats(), "Final driver state");
    println!("{}", String::from_utf8(buffer)?);
    Ok(())
}
