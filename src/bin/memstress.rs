//! PhotonDB memory core stress driver
//!
//! Spawns one thread per site and, for a number of rounds, has every site
//! churn its own pools and indexes, then elect the lowest site to mutate a
//! replicated object list in MP memory with a mirrored undo action. Every
//! fourth round is rolled back instead of committed.
//!
//! # Examples
//!
//! ```bash
//! memstress --sites 4 --rounds 200 --objects 2000
//! memstress --config memory.toml --json
//! ```

use clap::Parser;
use parking_lot::Mutex;
use photondb_memory::memory::ThreadLocalPool;
use photondb_memory::structures::{CompactingHashMap, CompactingMap};
use photondb_memory::sync::{ConditionalSynchronizedExecuteWithMpMemory, EngineLocals, SiteContext};
use photondb_memory::telemetry;
use photondb_memory::undo::FnUndoAction;
use photondb_memory::{MemoryConfig, PartitionId, Relocatable, SynchronizedThreadLock};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Exercise the partition memory core from several site threads
#[derive(Parser, Debug)]
#[command(name = "memstress")]
#[command(version = photondb_memory::VERSION)]
#[command(about = "Stress the PhotonDB partition memory core", long_about = None)]
struct Cli {
    /// Site threads to run
    #[arg(long, default_value_t = 4)]
    sites: usize,

    /// Coordinated rounds per site
    #[arg(long, default_value_t = 100)]
    rounds: usize,

    /// Objects allocated per site and round
    #[arg(long, default_value_t = 1000)]
    objects: usize,

    /// Optional TOML memory configuration
    #[arg(long, env = "PHOTONDB_MEMORY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

#[derive(Debug, Serialize)]
struct SiteReport {
    partition: i32,
    elected_rounds: usize,
    peak_pool_bytes: usize,
    final_pool_bytes: usize,
    index_entries: usize,
    index_bytes: usize,
}

#[derive(Debug, Serialize)]
struct Report {
    version: &'static str,
    sites: usize,
    rounds: usize,
    objects_per_round: usize,
    replicated_objects_committed: usize,
    elapsed_ms: u128,
    site_reports: Vec<SiteReport>,
}

/// Objects created in MP memory, shared by every site.
#[derive(Default)]
struct ReplicatedList {
    objects: Mutex<Vec<Relocatable>>,
    committed: Mutex<usize>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_level, cli.json, !cli.no_color)?;
    telemetry::describe_metrics();

    let config = MemoryConfig::load(cli.config.as_ref())?;
    config.install();
    anyhow::ensure!(cli.sites > 0, "at least one site is required");

    info!(sites = cli.sites, rounds = cli.rounds, objects = cli.objects, "Starting memory stress");
    let started = Instant::now();
    let lock = SynchronizedThreadLock::create();
    let replicated = Arc::new(ReplicatedList::default());
    let ready = Arc::new(std::sync::Barrier::new(cli.sites));

    let site_reports = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..cli.sites)
            .map(|site| {
                let lock = Arc::clone(&lock);
                let replicated = Arc::clone(&replicated);
                let ready = Arc::clone(&ready);
                let cli = &cli;
                std::thread::Builder::new()
                    .name(format!("site-{}", site))
                    .spawn_scoped(scope, move || run_site(site as i32, cli, &lock, &replicated, &ready))
            })
            .collect::<std::io::Result<_>>()?;
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| anyhow::anyhow!("site thread panicked"))
            })
            .collect::<anyhow::Result<Vec<_>>>()
    })?;

    lock.destroy();
    let report = Report {
        version: photondb_memory::VERSION,
        sites: cli.sites,
        rounds: cli.rounds,
        objects_per_round: cli.objects,
        replicated_objects_committed: *replicated.committed.lock(),
        elapsed_ms: started.elapsed().as_millis(),
        site_reports,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_site(
    id: i32,
    cli: &Cli,
    lock: &Arc<SynchronizedThreadLock>,
    replicated: &Arc<ReplicatedList>,
    ready: &std::sync::Barrier,
) -> SiteReport {
    let partition = PartitionId::Site(id);
    let _pool = ThreadLocalPool::new();
    ThreadLocalPool::set_partition_ids(partition);
    let site = SiteContext::new(partition);
    lock.init(cli.sites, EngineLocals::current(site.clone()));
    ready.wait();

    let mut index: CompactingMap<u64, usize> = CompactingMap::new(false);
    let mut lookup: CompactingHashMap<u64, usize> = CompactingHashMap::new();
    let mut peak_pool_bytes = 0;
    let mut elected_rounds = 0;
    let mut seed = 0x9e37_79b9_7f4a_7c15u64 ^ id as u64;

    for round in 0..cli.rounds {
        let token = round as i64 + 1;
        let quantum = site.begin_undo_quantum(token);

        // local churn: every object lands in both indexes, then half go away
        let mut live: Vec<(u64, Relocatable)> = Vec::with_capacity(cli.objects);
        for n in 0..cli.objects {
            seed = next_random(seed);
            let len = 1 + (seed % 300) as usize;
            let object = ThreadLocalPool::allocate_relocatable(len);
            ThreadLocalPool::with_relocatable_mut(&object, |bytes| bytes.fill(n as u8));
            let key = seed >> 16;
            index.insert(key, n);
            lookup.insert(key, n);
            live.push((key, object));
        }
        peak_pool_bytes = peak_pool_bytes.max(ThreadLocalPool::pool_allocation_size());
        for (n, (key, object)) in live.into_iter().enumerate() {
            if n % 2 == 0 {
                index.erase_exact(&key, &n);
                lookup.erase(&key);
            }
            ThreadLocalPool::free_relocatable(object);
        }

        // replicated change, made once by the lowest site
        let guard = ConditionalSynchronizedExecuteWithMpMemory::new(lock, true, lock.is_lowest_site_context());
        if guard.ok_to_execute() {
            elected_rounds += 1;
            let object = ThreadLocalPool::allocate_relocatable(64);
            replicated.objects.lock().push(object);

            let undo_list = Arc::clone(replicated);
            let release_list = Arc::clone(replicated);
            let action = FnUndoAction::new(
                move || {
                    if let Some(object) = undo_list.objects.lock().pop() {
                        ThreadLocalPool::free_relocatable(object);
                    }
                },
                move || *release_list.committed.lock() += 1,
            );
            lock.add_undo_action(true, &quantum, Box::new(action), None);
        }
        drop(guard);

        if round % 4 == 3 {
            debug!(token, "Rolling back round");
            site.undo(token);
        } else {
            site.release(token);
        }
    }

    // hand the replicated objects back before MP memory goes away
    let guard = ConditionalSynchronizedExecuteWithMpMemory::new(lock, true, lock.is_lowest_site_context());
    if guard.ok_to_execute() {
        for object in replicated.objects.lock().drain(..) {
            ThreadLocalPool::free_relocatable(object);
        }
    }
    drop(guard);

    let final_pool_bytes = ThreadLocalPool::pool_allocation_size();
    metrics::gauge!(telemetry::POOL_BYTES, "partition" => id.to_string()).set(final_pool_bytes as f64);
    let report = SiteReport {
        partition: id,
        elected_rounds,
        peak_pool_bytes,
        final_pool_bytes,
        index_entries: index.len(),
        index_bytes: index.bytes_allocated() + lookup.bytes_allocated(),
    };
    // every site stays registered until the last replicated free is done
    ready.wait();
    report
}

fn next_random(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}
