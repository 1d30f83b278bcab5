// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::Serialize;
use sharefs_core::{
    Access, CleanupFlags, Disposition, FsConfig, FsError, FsResult, FsStats, HandleId,
    OpenRequest, ShareFs, WriteMode,
};
use sharefs_pathlock::{NormalizedPath, PathLocker};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const WORK_ROOT: &str = "/stress";

fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => {
            let json_output = args.json_output.clone();
            let report = run_workload(args)?;
            if let Some(path) = json_output {
                serde_json::to_writer_pretty(File::create(&path)?, &report)?;
            }
            write_json_to_stdout(&report)?;
        }
        Command::Locks(args) => {
            let json_output = args.json_output.clone();
            let report = run_lock_workload(args)?;
            if let Some(path) = json_output {
                serde_json::to_writer_pretty(File::create(&path)?, &report)?;
            }
            write_json_to_stdout(&report)?;
        }
    }
    Ok(())
}

fn write_json_to_stdout<T: serde::Serialize>(value: &T) -> Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    out.flush()?;
    Ok(())
}

#[derive(Parser)]
#[command(author, version, about = "sharefs concurrency stress runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive random handle lifecycles against an in-process filesystem
    Run(RunArgs),
    /// Hammer the path lock table directly and check exclusivity
    Locks(LocksArgs),
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Number of worker threads
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Duration of the workload in seconds
    #[arg(long, default_value_t = 10)]
    duration_sec: u64,

    /// Stop each worker after this many operations
    #[arg(long)]
    ops_per_thread: Option<u64>,

    /// Number of directories under the work root
    #[arg(long, default_value_t = 4)]
    dirs: usize,

    /// Number of file names per directory
    #[arg(long, default_value_t = 8)]
    files_per_dir: usize,

    /// Maximum size of a single write in bytes
    #[arg(long, default_value_t = 4096)]
    max_write: usize,

    /// Base RNG seed; derived from the clock when omitted
    #[arg(long)]
    seed: Option<u64>,

    /// JSON filesystem configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Optional path for writing the JSON report
    #[arg(long)]
    json_output: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct LocksArgs {
    /// Number of worker threads
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Lock attempts per thread
    #[arg(long, default_value_t = 100_000)]
    iterations: u64,

    /// Depth of the synthetic path tree
    #[arg(long, default_value_t = 3)]
    depth: usize,

    /// Children per directory in the synthetic path tree
    #[arg(long, default_value_t = 2)]
    fanout: usize,

    /// Share of attempts that ask for an exclusive lock
    #[arg(long, default_value_t = 0.3)]
    write_ratio: f64,

    /// Base RNG seed; derived from the clock when omitted
    #[arg(long)]
    seed: Option<u64>,

    /// Optional path for writing the JSON report
    #[arg(long)]
    json_output: Option<PathBuf>,
}

fn load_config(path: Option<&Path>) -> Result<FsConfig> {
    let Some(path) = path else {
        return Ok(FsConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    FsConfig::from_json_str(&raw)
        .with_context(|| format!("failed to parse config {}", path.display()))
}

fn base_seed(seed: Option<u64>) -> u64 {
    seed.unwrap_or_else(|| {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
        nanos ^ ((std::process::id() as u64) << 32)
    })
}

fn timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

fn merge_counts(target: &mut HashMap<String, u64>, source: &HashMap<String, u64>) {
    for (key, value) in source {
        *target.entry(key.clone()).or_insert(0) += value;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Read,
    Write,
    Append,
    Supersede,
    Rename,
    DeleteOnClose,
    List,
}

impl Operation {
    const ALL: [Operation; 7] = [
        Operation::Read,
        Operation::Write,
        Operation::Append,
        Operation::Supersede,
        Operation::Rename,
        Operation::DeleteOnClose,
        Operation::List,
    ];

    fn label(self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Append => "append",
            Operation::Supersede => "supersede",
            Operation::Rename => "rename",
            Operation::DeleteOnClose => "delete_on_close",
            Operation::List => "list",
        }
    }
}

#[derive(Default, Serialize, Clone)]
struct OperationStats {
    read: u64,
    write: u64,
    append: u64,
    supersede: u64,
    rename: u64,
    delete_on_close: u64,
    list: u64,
}

impl OperationStats {
    fn increment(&mut self, op: Operation) {
        match op {
            Operation::Read => self.read += 1,
            Operation::Write => self.write += 1,
            Operation::Append => self.append += 1,
            Operation::Supersede => self.supersede += 1,
            Operation::Rename => self.rename += 1,
            Operation::DeleteOnClose => self.delete_on_close += 1,
            Operation::List => self.list += 1,
        }
    }

    fn total(&self) -> u64 {
        self.read
            + self.write
            + self.append
            + self.supersede
            + self.rename
            + self.delete_on_close
            + self.list
    }
}

impl std::ops::AddAssign<&OperationStats> for OperationStats {
    fn add_assign(&mut self, other: &OperationStats) {
        self.read += other.read;
        self.write += other.write;
        self.append += other.append;
        self.supersede += other.supersede;
        self.rename += other.rename;
        self.delete_on_close += other.delete_on_close;
        self.list += other.list;
    }
}

#[derive(Serialize, Clone)]
struct RunReport {
    phase: String,
    threads: usize,
    duration_sec: u64,
    seed: u64,
    start_time: String,
    end_time: String,
    operations: OperationStats,
    total_ops: u64,
    completed: u64,
    benign_errors: HashMap<String, u64>,
    fatal_errors: HashMap<String, u64>,
    final_stats: FsStats,
    status: String,
}

fn run_workload(args: RunArgs) -> Result<RunReport> {
    let config = load_config(args.config.as_deref())?;
    let faults_enabled = config.faults.enabled;
    let share = Arc::new(ShareFs::new(config).context("failed to initialise filesystem")?);

    let dirs = prepare_tree(&share, args.dirs.max(1))?;
    let seed = base_seed(args.seed);

    info!(
        "handle workload: threads={}, duration={}s, dirs={}, files_per_dir={}, seed={}",
        args.threads,
        args.duration_sec,
        dirs.len(),
        args.files_per_dir,
        seed
    );

    let start_time = chrono::Utc::now();
    let stop_at = Instant::now() + Duration::from_secs(args.duration_sec);

    let mut handles = Vec::with_capacity(args.threads);
    for worker_id in 0..args.threads {
        let worker = Worker {
            id: worker_id,
            share: Arc::clone(&share),
            dirs: dirs.clone(),
            files_per_dir: args.files_per_dir.max(1),
            max_write: args.max_write.max(1),
            run_until: stop_at,
            ops_limit: args.ops_per_thread,
            faults_enabled,
            rng: SmallRng::seed_from_u64(seed ^ worker_id as u64),
        };
        handles.push(thread::spawn(move || worker.run()));
    }

    let mut operations = OperationStats::default();
    let mut completed = 0;
    let mut benign_errors: HashMap<String, u64> = HashMap::new();
    let mut fatal_errors: HashMap<String, u64> = HashMap::new();

    for handle in handles {
        match handle.join() {
            Ok(result) => {
                operations += &result.stats;
                completed += result.completed;
                merge_counts(&mut benign_errors, &result.benign_errors);
                merge_counts(&mut fatal_errors, &result.fatal_errors);
            }
            Err(panic) => {
                *fatal_errors.entry("thread_panic".to_string()).or_insert(0) += 1;
                warn!("worker thread panicked: {}", panic_message(panic.as_ref()));
            }
        }
    }

    let final_stats = share.stats();
    if final_stats.open_handles != 0 {
        warn!("{} handles still open after workload", final_stats.open_handles);
        *fatal_errors.entry("leaked_handles".to_string()).or_insert(0) +=
            final_stats.open_handles as u64;
    }
    if final_stats.locked_paths != 0 {
        warn!("{} paths still locked after workload", final_stats.locked_paths);
        *fatal_errors.entry("leaked_locks".to_string()).or_insert(0) +=
            final_stats.locked_paths as u64;
    }

    let end_time = chrono::Utc::now();
    let status = if fatal_errors.is_empty() { "passed" } else { "failed" };

    Ok(RunReport {
        phase: "handles".to_string(),
        threads: args.threads,
        duration_sec: args.duration_sec,
        seed,
        start_time: timestamp(start_time),
        end_time: timestamp(end_time),
        total_ops: operations.total(),
        operations,
        completed,
        benign_errors,
        fatal_errors,
        final_stats,
        status: status.to_string(),
    })
}

fn prepare_tree(share: &ShareFs, dirs: usize) -> Result<Vec<String>> {
    let request = OpenRequest {
        disposition: Disposition::OpenIf,
        ..OpenRequest::create_dir()
    };
    let mut created = Vec::with_capacity(dirs);
    let root_paths =
        std::iter::once(WORK_ROOT.to_string()).chain((0..dirs).map(|i| format!("{WORK_ROOT}/d{i}")));
    for path in root_paths {
        let (id, _) = share
            .open(&path, &request)
            .with_context(|| format!("failed to create directory {path}"))?;
        share.close(id);
        if path != WORK_ROOT {
            created.push(path);
        }
    }
    Ok(created)
}

struct Worker {
    id: usize,
    share: Arc<ShareFs>,
    dirs: Vec<String>,
    files_per_dir: usize,
    max_write: usize,
    run_until: Instant,
    ops_limit: Option<u64>,
    faults_enabled: bool,
    rng: SmallRng,
}

struct WorkerResult {
    stats: OperationStats,
    completed: u64,
    benign_errors: HashMap<String, u64>,
    fatal_errors: HashMap<String, u64>,
}

enum Outcome {
    Benign(&'static str),
    Fatal(&'static str),
}

/// Sort an operation failure into expected contention and real defects.
fn classify(err: &FsError, faults_enabled: bool) -> Outcome {
    if err.is_sharing_violation() {
        return Outcome::Benign("sharing_violation");
    }
    match err {
        FsError::NotFound => Outcome::Benign("not_found"),
        FsError::AlreadyExists => Outcome::Benign("already_exists"),
        FsError::EndOfFile => Outcome::Benign("end_of_file"),
        FsError::DirectoryNotEmpty => Outcome::Benign("directory_not_empty"),
        FsError::NoSpace | FsError::AccessDenied | FsError::Io(_) if faults_enabled => {
            Outcome::Benign("injected_fault")
        }
        FsError::InvalidHandle => Outcome::Fatal("invalid_handle"),
        FsError::AccessDenied => Outcome::Fatal("access_denied"),
        FsError::TooManyOpenFiles => Outcome::Fatal("too_many_open_files"),
        _ => Outcome::Fatal("unexpected_error"),
    }
}

impl Worker {
    fn run(mut self) -> WorkerResult {
        let mut result = WorkerResult {
            stats: OperationStats::default(),
            completed: 0,
            benign_errors: HashMap::new(),
            fatal_errors: HashMap::new(),
        };
        let mut done = 0u64;
        while Instant::now() < self.run_until && self.ops_limit.map_or(true, |limit| done < limit) {
            let op = Operation::ALL[self.rng.gen_range(0..Operation::ALL.len())];
            result.stats.increment(op);
            done += 1;
            match self.execute(op) {
                Ok(()) => result.completed += 1,
                Err(err) => match classify(&err, self.faults_enabled) {
                    Outcome::Benign(label) => {
                        *result.benign_errors.entry(label.to_string()).or_insert(0) += 1;
                    }
                    Outcome::Fatal(label) => {
                        warn!(worker = self.id, op = op.label(), error = %err, "operation failed");
                        *result.fatal_errors.entry(label.to_string()).or_insert(0) += 1;
                    }
                },
            }
        }
        debug!(worker = self.id, ops = done, "worker finished");
        result
    }

    fn random_file(&mut self) -> String {
        let dir = &self.dirs[self.rng.gen_range(0..self.dirs.len())];
        format!("{dir}/f{}", self.rng.gen_range(0..self.files_per_dir))
    }

    fn random_payload(&mut self) -> Vec<u8> {
        let mut data = vec![0u8; self.rng.gen_range(1..=self.max_write)];
        self.rng.fill(&mut data[..]);
        data
    }

    fn execute(&mut self, op: Operation) -> FsResult<()> {
        match op {
            Operation::Read => {
                let path = self.random_file();
                let (id, info) = self.share.open(&path, &OpenRequest::open(Access::read_only()))?;
                let mut buf = vec![0u8; self.max_write];
                self.with_handle(id, |share| {
                    match share.read(id, &mut buf, 0) {
                        Ok(_) => Ok(()),
                        Err(FsError::EndOfFile) if info.file_size == 0 => Ok(()),
                        Err(err) => Err(err),
                    }
                })
            }
            Operation::Write => {
                let path = self.random_file();
                let data = self.random_payload();
                let offset = self.rng.gen_range(0..self.max_write as u64);
                let request = OpenRequest::create_file(Access::read_write(), Disposition::OpenIf);
                let (id, _) = self.share.open(&path, &request)?;
                self.with_handle(id, |share| {
                    share.write(id, &data, offset, WriteMode::default())?;
                    share.flush(Some(id)).map(drop)
                })
            }
            Operation::Append => {
                let path = self.random_file();
                let data = self.random_payload();
                let access = Access {
                    append: true,
                    ..Access::default()
                };
                let request = OpenRequest::create_file(access, Disposition::OpenIf);
                let (id, _) = self.share.open(&path, &request)?;
                let mode = WriteMode {
                    to_end_of_file: true,
                    ..WriteMode::default()
                };
                self.with_handle(id, |share| share.write(id, &data, 0, mode).map(drop))
            }
            Operation::Supersede => {
                let path = self.random_file();
                let data = self.random_payload();
                let request = OpenRequest::create_file(Access::read_write(), Disposition::Supersede);
                let (id, _) = self.share.open(&path, &request)?;
                self.with_handle(id, |share| share.write(id, &data, 0, WriteMode::default()).map(drop))
            }
            Operation::Rename => {
                let from = self.random_file();
                let to = self.random_file();
                if to == from {
                    return Ok(());
                }
                let request = OpenRequest::open(Access::read_only().with_delete());
                let (id, _) = self.share.open(&from, &request)?;
                self.with_handle(id, |share| {
                    share.rename(id, &to, false)?;
                    let now = share.handle_path(id)?;
                    if now != NormalizedPath::new(&to) {
                        return Err(FsError::InvalidParameter);
                    }
                    Ok(())
                })
            }
            Operation::DeleteOnClose => {
                let path = self.random_file();
                let data = self.random_payload();
                let request =
                    OpenRequest::create_file(Access::read_write().with_delete(), Disposition::OpenIf)
                        .delete_on_close();
                let (id, _) = self.share.open(&path, &request)?;
                self.with_handle(id, |share| {
                    share.write(id, &data, 0, WriteMode::default())?;
                    share.cleanup(id, CleanupFlags::from_raw(CleanupFlags::DELETE))
                })
            }
            Operation::List => {
                let dir = self.dirs[self.rng.gen_range(0..self.dirs.len())].clone();
                let (id, _) = self.share.open(&dir, &OpenRequest::open(Access::read_only()))?;
                self.with_handle(id, |share| {
                    let first = share.read_directory(id, None)?;
                    if let Some(marker) = first.first() {
                        let rest = share.read_directory(id, Some(&marker.name))?;
                        if rest.len() + 1 != first.len() {
                            return Err(FsError::InvalidParameter);
                        }
                    }
                    Ok(())
                })
            }
        }
    }

    /// Run `op` and close the handle whatever the outcome.
    fn with_handle<T>(&self, id: HandleId, op: impl FnOnce(&ShareFs) -> FsResult<T>) -> FsResult<T> {
        let result = op(&self.share);
        self.share.close(id);
        result
    }
}

#[derive(Serialize, Clone, Default)]
struct LockCounts {
    shared: u64,
    exclusive: u64,
    busy: u64,
    violations: u64,
}

impl std::ops::AddAssign<&LockCounts> for LockCounts {
    fn add_assign(&mut self, other: &LockCounts) {
        self.shared += other.shared;
        self.exclusive += other.exclusive;
        self.busy += other.busy;
        self.violations += other.violations;
    }
}

#[derive(Serialize, Clone)]
struct LockReport {
    phase: String,
    threads: usize,
    iterations: u64,
    paths: usize,
    seed: u64,
    start_time: String,
    end_time: String,
    counts: LockCounts,
    thread_panics: u64,
    leaked_slots: usize,
    pooled_slots: usize,
    status: String,
}

/// Every path of a tree with `fanout` children per level, top down.
fn synthetic_paths(depth: usize, fanout: usize) -> Vec<NormalizedPath> {
    let mut paths = Vec::new();
    let mut level = vec![NormalizedPath::root()];
    for _ in 0..depth {
        let next: Vec<_> = level
            .iter()
            .flat_map(|parent| (0..fanout).map(move |i| parent.join(&format!("n{i}"))))
            .collect();
        paths.extend(next.iter().cloned());
        level = next;
    }
    paths
}

/// Independent record of who holds what, updated only while a lock is held.
///
/// Counters mirror lock slots: a positive value counts shared holders, -1
/// marks an exclusive holder. A failed transition means two holders the lock
/// table should have kept apart were admitted together.
struct HeldCounts {
    counts: HashMap<String, AtomicIsize>,
}

impl HeldCounts {
    fn new(paths: &[NormalizedPath]) -> Self {
        let counts = paths
            .iter()
            .map(|path| (path.as_str().to_string(), AtomicIsize::new(0)))
            .collect();
        Self { counts }
    }

    /// Record a grant; returns the slots entered and the number of conflicts.
    fn enter<'a>(&self, path: &'a NormalizedPath, exclusive: bool) -> (Vec<(&'a str, bool)>, u64) {
        let depth = path.depth();
        let mut entered = Vec::with_capacity(depth);
        let mut conflicts = 0;
        for (level, prefix) in path.ancestors().enumerate() {
            let Some(counter) = self.counts.get(prefix) else {
                continue;
            };
            let as_exclusive = exclusive && level + 1 == depth;
            let ok = if as_exclusive {
                counter.compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire).is_ok()
            } else {
                counter
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n >= 0).then_some(n + 1))
                    .is_ok()
            };
            if ok {
                entered.push((prefix, as_exclusive));
            } else {
                conflicts += 1;
            }
        }
        (entered, conflicts)
    }

    fn leave(&self, entered: &[(&str, bool)]) {
        for (prefix, exclusive) in entered.iter().rev() {
            if let Some(counter) = self.counts.get(*prefix) {
                if *exclusive {
                    counter.store(0, Ordering::Release);
                } else {
                    counter.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }
    }
}

fn run_lock_workload(args: LocksArgs) -> Result<LockReport> {
    let paths = Arc::new(synthetic_paths(args.depth.max(1), args.fanout.max(1)));
    let held = Arc::new(HeldCounts::new(&paths));
    let locker = PathLocker::new();
    let seed = base_seed(args.seed);
    let write_ratio = args.write_ratio.clamp(0.0, 1.0);

    info!(
        "lock workload: threads={}, iterations={}, paths={}, seed={}",
        args.threads,
        args.iterations,
        paths.len(),
        seed
    );

    let start_time = chrono::Utc::now();
    let mut handles = Vec::with_capacity(args.threads);
    for worker_id in 0..args.threads {
        let paths = Arc::clone(&paths);
        let held = Arc::clone(&held);
        let locker = locker.clone();
        let iterations = args.iterations;
        handles.push(thread::spawn(move || {
            let mut rng = SmallRng::seed_from_u64(seed ^ worker_id as u64);
            let mut counts = LockCounts::default();
            for _ in 0..iterations {
                let path = &paths[rng.gen_range(0..paths.len())];
                let exclusive = rng.gen_bool(write_ratio);
                let attempt = if exclusive {
                    locker.write_normalized(path)
                } else {
                    locker.read_normalized(path)
                };
                let Ok(mut lock) = attempt else {
                    counts.busy += 1;
                    continue;
                };
                if exclusive {
                    counts.exclusive += 1;
                } else {
                    counts.shared += 1;
                }
                let (entered, conflicts) = held.enter(path, exclusive);
                counts.violations += conflicts;
                thread::yield_now();
                held.leave(&entered);
                lock.unlock();
            }
            counts
        }));
    }

    let mut counts = LockCounts::default();
    let mut thread_panics = 0;
    for handle in handles {
        match handle.join() {
            Ok(result) => counts += &result,
            Err(panic) => {
                thread_panics += 1;
                warn!("lock worker panicked: {}", panic_message(panic.as_ref()));
            }
        }
    }

    let table = locker.table();
    let leaked_slots = table.len();
    if leaked_slots != 0 {
        warn!("{} lock slots left behind: {:?}", leaked_slots, table.snapshot());
    }
    let status = if counts.violations == 0 && thread_panics == 0 && leaked_slots == 0 {
        "passed"
    } else {
        "failed"
    };

    Ok(LockReport {
        phase: "locks".to_string(),
        threads: args.threads,
        iterations: args.iterations,
        paths: paths.len(),
        seed,
        start_time: timestamp(start_time),
        end_time: timestamp(chrono::Utc::now()),
        counts,
        thread_panics,
        leaked_slots,
        pooled_slots: table.pooled_slots(),
        status: status.to_string(),
    })
}
