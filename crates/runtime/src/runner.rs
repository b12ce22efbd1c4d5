//! Daemon assembly: wires the watch service, the ingestion queue, the worker
//! and the intake ledger together, and owns their lifetimes.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{Local, Utc};
use dropline_config::{AppConfig, WatchBackend};
use dropline_pipeline::{PipelineOptions, PipelineReport, run_pipeline};
use dropline_watcher::{
    EventSource, IngestCallback, NotifyBackend, PollBackend, RecentPathCache, StabilityPolicy,
    WatchService,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::clients::ClientWatch;
use crate::ledger::{IntakeLedger, IntakeRecord};
use crate::outcome::TerminalOutcome;
use crate::queue::{IngestReceiver, IngestSender, ingestion_queue};

/// How long the intake ledger remembers terminal outcomes.
const LEDGER_RETENTION_DAYS: i64 = 30;

/// How long `stop` waits for background tasks before abandoning them.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

// ── Processed-path ledger ─────────────────────────────────────────────────────

/// Duplicate suppression for the worker: a fast in-memory set layered over
/// the durable [`IntakeLedger`].
struct ProcessedLedger {
    durable: IntakeLedger,
    entries: Mutex<HashSet<PathBuf>>,
}

impl ProcessedLedger {
    fn new(durable: IntakeLedger, seed: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            durable,
            entries: Mutex::new(seed.into_iter().collect()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether `path` already reached a terminal outcome. A same-named file
    /// in `archive` counts as processed and is memoized so the existence
    /// check runs at most once per path.
    fn already_processed(&self, path: &Path, archive: Option<&Path>) -> bool {
        let mut entries = self.lock();
        if entries.contains(path) {
            return true;
        }
        let archived = archive
            .zip(path.file_name())
            .is_some_and(|(dir, name)| dir.join(name).exists());
        if archived {
            entries.insert(path.to_path_buf());
        }
        archived
    }

    /// Record a terminal outcome in memory and on disk. A failed append is
    /// logged but keeps the in-memory entry, so the current run never
    /// reprocesses the file.
    async fn record(&self, record: IntakeRecord) {
        self.lock().insert(record.path.clone());
        if let Err(err) = self.durable.append(&record).await {
            warn!(
                path = %record.path.display(),
                error = %err,
                "intake ledger append failed"
            );
        }
    }
}

// ── Run counters ──────────────────────────────────────────────────────────────

/// Counters for one daemon run, shared between the worker and the handle.
#[derive(Debug, Default)]
pub struct DaemonStats {
    queued: AtomicU64,
    archived: AtomicU64,
    quarantined: AtomicU64,
}

impl DaemonStats {
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn archived(&self) -> u64 {
        self.archived.load(Ordering::Relaxed)
    }

    pub fn quarantined(&self) -> u64 {
        self.quarantined.load(Ordering::Relaxed)
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

struct WorkerContext {
    clients: Arc<Vec<ClientWatch>>,
    ledger: Arc<ProcessedLedger>,
    options: PipelineOptions,
    log_dir: PathBuf,
    stats: Arc<DaemonStats>,
}

fn route<'a>(clients: &'a [ClientWatch], path: &Path) -> Option<&'a ClientWatch> {
    clients.iter().find(|watch| watch.owns(path))
}

/// Move `path` into `dir`, keeping its name unless that name is taken, in
/// which case a local timestamp is appended to the stem.
fn move_into(path: &Path, dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let name = path.file_name().context("source path has no file name")?;
    let mut dest = dir.join(name);
    if dest.exists() {
        let stem = path.file_stem().unwrap_or(name).to_string_lossy();
        let ext = path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        dest = dir.join(format!("{stem}_{stamp}{ext}"));
        // The stamp has one-second granularity; repeats within that second
        // take a counter suffix instead of overwriting.
        let mut seq = 2;
        while dest.exists() {
            dest = dir.join(format!("{stem}_{stamp}_{seq}{ext}"));
            seq += 1;
        }
    }
    fs::rename(path, &dest)
        .with_context(|| format!("moving {} to {}", path.display(), dest.display()))?;
    Ok(dest)
}

/// Move a failed input into the quarantine folder and drop a `.error.txt`
/// sidecar next to it describing what went wrong.
fn quarantine_file(path: &Path, dir: &Path, detail: &str) -> Result<PathBuf> {
    let dest = move_into(path, dir)?;
    let sidecar = dest.with_extension("error.txt");
    fs::write(&sidecar, detail).with_context(|| format!("writing {}", sidecar.display()))?;
    Ok(dest)
}

async fn read_and_run(
    path: &Path,
    client: &ClientWatch,
    ctx: &WorkerContext,
) -> Result<PipelineReport> {
    // Strict UTF-8: an undecodable file is a processing failure and lands in
    // quarantine rather than producing a garbled batch.
    let raw_text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;

    let resolved = client.client.clone();
    let options = ctx.options.clone();
    let log_dir = ctx.log_dir.clone();
    let input_files = vec![path.display().to_string()];
    let report = tokio::task::spawn_blocking(move || {
        run_pipeline(
            &resolved,
            &raw_text,
            &input_files,
            "watch_folder",
            &log_dir,
            &options,
        )
    })
    .await
    .map_err(|err| anyhow::anyhow!("pipeline task panicked: {err}"))??;
    Ok(report)
}

async fn record_outcome(
    ctx: &WorkerContext,
    path: &Path,
    client: &ClientWatch,
    outcome: TerminalOutcome,
    moved_to: PathBuf,
) {
    ctx.ledger
        .record(IntakeRecord {
            path: path.to_path_buf(),
            client_id: client.client_id().to_string(),
            outcome,
            moved_to,
            occurred_at: Utc::now(),
        })
        .await;
}

/// Run one queued path to a terminal state. Never returns an error: every
/// failure is logged and resolved here so the queue can keep draining.
async fn process_path(path: &Path, ctx: &WorkerContext) {
    let Some(client) = route(&ctx.clients, path) else {
        error!(path = %path.display(), "no client inbox matches this path, dropping");
        return;
    };
    if ctx.ledger.already_processed(path, Some(client.archive())) {
        debug!(path = %path.display(), "already processed, skipping");
        return;
    }
    if !path.exists() {
        warn!(path = %path.display(), "file vanished before processing");
        return;
    }

    info!(path = %path.display(), client = client.client_id(), "processing file");
    let failure = match read_and_run(path, client, ctx).await {
        Ok(_) => match move_into(path, client.archive()) {
            Ok(dest) => {
                info!(dest = %dest.display(), "archived input file");
                record_outcome(ctx, path, client, TerminalOutcome::Archived, dest).await;
                ctx.stats.archived.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(err) => format!("archiving failed: {err:#}"),
        },
        Err(err) => format!("{err:#}"),
    };

    error!(
        path = %path.display(),
        client = client.client_id(),
        failure = %failure,
        "processing failed"
    );
    match quarantine_file(path, client.quarantine(), &failure) {
        Ok(dest) => {
            warn!(dest = %dest.display(), "quarantined input file");
            record_outcome(ctx, path, client, TerminalOutcome::Quarantined, dest).await;
            ctx.stats.quarantined.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            // Left in place; the next event or startup sweep retries it.
            error!(path = %path.display(), error = %err, "quarantine move failed");
        }
    }
}

async fn worker_loop(
    mut queue: IngestReceiver,
    ctx: Arc<WorkerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = queue.pop() => match next {
                Some(path) => process_path(&path, &ctx).await,
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("worker stopping");
                    break;
                }
            }
        }
    }
}

// ── Admission and sweep ───────────────────────────────────────────────────────

/// Callback run by the watch service once a file is stable. Routes the path
/// for the archive-name duplicate check, then hands it to the worker queue.
fn enqueue_callback(
    clients: Arc<Vec<ClientWatch>>,
    ledger: Arc<ProcessedLedger>,
    queue: IngestSender,
    stats: Arc<DaemonStats>,
    shutdown: watch::Receiver<bool>,
) -> IngestCallback {
    Arc::new(move |path: PathBuf| {
        if *shutdown.borrow() {
            return Ok(());
        }
        let path = std::path::absolute(&path).unwrap_or(path);
        let archive = route(&clients, &path).map(|watch| watch.archive().to_path_buf());
        if ledger.already_processed(&path, archive.as_deref()) {
            debug!(path = %path.display(), "skipping duplicate path");
            return Ok(());
        }
        if queue.enqueue(path.clone()) {
            stats.queued.fetch_add(1, Ordering::Relaxed);
            info!(path = %path.display(), "queued file");
        }
        Ok(())
    })
}

/// Admit every file already sitting in a watched inbox, for arrivals that
/// happened while the daemon was stopped. Admissions run sequentially; files
/// that settled long ago pass the stability probe on the first check.
async fn catch_up_sweep(
    clients: Arc<Vec<ClientWatch>>,
    service: Arc<WatchService>,
    recursive: bool,
    shutdown: watch::Receiver<bool>,
) {
    let mut candidates = Vec::new();
    for client in clients.iter() {
        let walker = WalkDir::new(client.inbox()).min_depth(1);
        let walker = if recursive { walker } else { walker.max_depth(1) };
        for entry in walker.into_iter().filter_map(|entry| entry.ok()) {
            if entry.file_type().is_file() {
                candidates.push(entry.into_path());
            }
        }
    }
    if candidates.is_empty() {
        return;
    }

    info!(count = candidates.len(), "sweeping inbox folders for leftover files");
    for path in candidates {
        if *shutdown.borrow() {
            return;
        }
        service.admit(path, shutdown.clone()).await;
    }
}

// ── Runner ────────────────────────────────────────────────────────────────────

/// Owns a validated daemon configuration and starts the background tasks.
pub struct DaemonRunner {
    config: AppConfig,
    clients: Arc<Vec<ClientWatch>>,
}

impl DaemonRunner {
    pub fn new(config: AppConfig, clients: Vec<ClientWatch>) -> Result<Self> {
        if clients.is_empty() {
            bail!("no watchable clients configured");
        }
        Ok(Self {
            config,
            clients: Arc::new(clients),
        })
    }

    /// Start the watch service, the catch-up sweep and the worker.
    ///
    /// Compacts the intake ledger first so the duplicate set does not grow
    /// without bound across restarts.
    pub async fn start(self) -> Result<DaemonHandle> {
        let log_dir = PathBuf::from(&self.config.daemon.log_dir);
        fs::create_dir_all(&log_dir)
            .with_context(|| format!("creating log dir {}", log_dir.display()))?;

        let durable = IntakeLedger::new(log_dir.join("intake_ledger.jsonl"));
        let kept = durable
            .compact(chrono::Duration::days(LEDGER_RETENTION_DAYS))
            .await?;
        let seed = kept.into_iter().map(|record| record.path);
        let ledger = Arc::new(ProcessedLedger::new(durable, seed));

        let stats = Arc::new(DaemonStats::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = ingestion_queue();

        let ctx = Arc::new(WorkerContext {
            clients: Arc::clone(&self.clients),
            ledger: Arc::clone(&ledger),
            options: PipelineOptions {
                use_ai: self.config.daemon.use_ai,
                auto_apply_max_risk: self.config.daemon.auto_apply_max_risk,
                max_ai_calls: self.config.daemon.max_ai_calls,
                dry_run: false,
            },
            log_dir,
            stats: Arc::clone(&stats),
        });

        let on_file = enqueue_callback(
            Arc::clone(&self.clients),
            ledger,
            queue_tx,
            Arc::clone(&stats),
            shutdown_rx.clone(),
        );

        let watch_cfg = &self.config.watch;
        let policy = StabilityPolicy {
            checks: watch_cfg.stable_checks,
            poll_delay: Duration::from_millis(watch_cfg.stable_delay_ms),
            timeout: Duration::from_millis(watch_cfg.stable_timeout_ms),
        };
        let recent = RecentPathCache::new(
            Duration::from_secs(watch_cfg.recent_ttl_secs),
            watch_cfg.recent_max,
        );
        let service = Arc::new(WatchService::new(
            policy,
            recent,
            watch_cfg.queue_cap,
            on_file,
        ));

        let roots: Vec<PathBuf> = self
            .clients
            .iter()
            .map(|client| client.inbox().to_path_buf())
            .collect();
        let recursive = self.config.daemon.recursive;
        let source: Box<dyn EventSource> = match self.config.daemon.backend {
            WatchBackend::Notify => Box::new(NotifyBackend::new(roots, recursive)),
            WatchBackend::Poll => Box::new(PollBackend::new(
                roots,
                recursive,
                Duration::from_millis(watch_cfg.poll_interval_ms),
            )),
        };

        let service_task = {
            let service = Arc::clone(&service);
            let shutdown = shutdown_rx.clone();
            tokio::spawn(async move { service.run(source, shutdown).await })
        };
        let sweep_task = tokio::spawn(catch_up_sweep(
            Arc::clone(&self.clients),
            service,
            recursive,
            shutdown_rx.clone(),
        ));
        let worker_task = tokio::spawn(worker_loop(queue_rx, ctx, shutdown_rx));

        info!(
            clients = self.clients.len(),
            backend = ?self.config.daemon.backend,
            "daemon started"
        );
        Ok(DaemonHandle {
            shutdown: shutdown_tx,
            service_task,
            sweep_task,
            worker_task,
            stats,
        })
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Running daemon. Dropping the handle without calling [`stop`] leaves the
/// background tasks running detached.
///
/// [`stop`]: DaemonHandle::stop
pub struct DaemonHandle {
    shutdown: watch::Sender<bool>,
    service_task: JoinHandle<Result<(), dropline_watcher::WatchError>>,
    sweep_task: JoinHandle<()>,
    worker_task: JoinHandle<()>,
    stats: Arc<DaemonStats>,
}

impl DaemonHandle {
    /// Subscribe a companion task (the Telegram bot) to this daemon's
    /// shutdown signal.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn stats(&self) -> Arc<DaemonStats> {
        Arc::clone(&self.stats)
    }

    /// Signal shutdown and wait for the background tasks to drain, up to
    /// [`SHUTDOWN_TIMEOUT`]. Tasks still running after that are abandoned.
    pub async fn stop(self) {
        let DaemonHandle {
            shutdown,
            service_task,
            sweep_task,
            worker_task,
            stats,
        } = self;

        let _ = shutdown.send(true);
        let drain = async move {
            if let Err(err) = sweep_task.await {
                warn!(error = %err, "sweep task join failed");
            }
            if let Err(err) = worker_task.await {
                warn!(error = %err, "worker task join failed");
            }
            match service_task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "watch service exited with error"),
                Err(err) => warn!(error = %err, "watch service join failed"),
            }
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            warn!("shutdown timed out, abandoning background tasks");
        }
        info!(
            queued = stats.queued(),
            archived = stats.archived(),
            quarantined = stats.quarantined(),
            "daemon stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use dropline_config::{
        ClientDefaults, ClientEntry, DaemonSection, ExportSettings, FolderOverrides,
        REQUIRED_EXPORT_FIELDS, ServiceRule, TelegramSection, Trigger, WatchSection,
    };
    use tempfile::TempDir;

    use crate::clients::build_client_watches;

    const BATCH: &str = "Ann Price\n1 High Street\nBromley\nBR5 4AR\n";

    fn sample_config(root: &Path, backend: WatchBackend) -> AppConfig {
        let column_mapping: BTreeMap<String, u32> = REQUIRED_EXPORT_FIELDS
            .iter()
            .enumerate()
            .map(|(idx, field)| (field.to_string(), idx as u32 + 1))
            .collect();
        let mut clients = BTreeMap::new();
        clients.insert(
            "client_01".to_string(),
            ClientEntry {
                display_name: "First Client".to_string(),
                defaults: ClientDefaults {
                    service: "tracked48".to_string(),
                    weight_kg: 1.0,
                    country: None,
                    reference_prefix: None,
                },
                services: vec![ServiceRule {
                    name: "tracked48".to_string(),
                    code: None,
                    trigger: Trigger::Default,
                }],
                export: ExportSettings { column_mapping },
                folders: FolderOverrides::default(),
            },
        );
        AppConfig {
            clients_root: root.join("clients").display().to_string(),
            daemon: DaemonSection {
                use_telegram: false,
                backend,
                log_dir: root.join("logs").display().to_string(),
                ..Default::default()
            },
            watch: WatchSection {
                stable_checks: 2,
                stable_delay_ms: 10,
                stable_timeout_ms: 2_000,
                poll_interval_ms: 50,
                ..Default::default()
            },
            telegram: TelegramSection::default(),
            clients,
        }
    }

    async fn start_daemon(config: &AppConfig) -> DaemonHandle {
        let watches = build_client_watches(config, None).unwrap();
        let runner = DaemonRunner::new(config.clone(), watches).unwrap();
        runner.start().await.unwrap()
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .map(|it| {
                it.filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    async fn wait_until(what: &str, check: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn move_into_adds_suffix_on_collision() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("archive");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("orders.txt"), b"old").unwrap();

        let src = dir.path().join("orders.txt");
        fs::write(&src, b"new").unwrap();
        let dest = move_into(&src, &target).unwrap();

        assert_ne!(dest, target.join("orders.txt"));
        let name = dest.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("orders_"), "unexpected name {name}");
        assert!(name.ends_with(".txt"));
        assert_eq!(fs::read(&dest).unwrap(), b"new");
        assert!(!src.exists());
    }

    #[test]
    fn move_into_never_overwrites_on_repeat_collisions() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("archive");
        fs::create_dir_all(&target).unwrap();

        // Three same-named files landing back to back, well inside the
        // one-second stamp granularity.
        let mut dests = Vec::new();
        for body in ["first", "second", "third"] {
            let src = dir.path().join("orders.txt");
            fs::write(&src, body).unwrap();
            dests.push(move_into(&src, &target).unwrap());
        }

        let mut names = dests.clone();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 3, "collision handling reused a name");
        assert_eq!(entries(&target).len(), 3);
        for (dest, body) in dests.iter().zip(["first", "second", "third"]) {
            assert_eq!(fs::read_to_string(dest).unwrap(), body);
        }
    }

    #[test]
    fn quarantine_writes_error_sidecar() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("orders.txt");
        fs::write(&src, b"junk").unwrap();

        let quarantine = dir.path().join("quarantine");
        let dest = quarantine_file(&src, &quarantine, "no valid records").unwrap();

        assert_eq!(dest, quarantine.join("orders.txt"));
        let sidecar = quarantine.join("orders.error.txt");
        assert_eq!(fs::read_to_string(sidecar).unwrap(), "no valid records");
    }

    #[tokio::test]
    async fn startup_sweep_processes_preexisting_file() {
        let dir = TempDir::new().unwrap();
        let config = sample_config(dir.path(), WatchBackend::Notify);
        let watches = build_client_watches(&config, None).unwrap();
        let inbox = watches[0].inbox().to_path_buf();
        let archive = watches[0].archive().to_path_buf();
        fs::write(inbox.join("orders.txt"), BATCH).unwrap();

        let handle = start_daemon(&config).await;
        wait_until("file to be archived", || {
            archive.join("orders.txt").exists()
        })
        .await;
        handle.stop().await;

        assert!(entries(&inbox).is_empty());
        let ready = config.resolve_client("client_01").unwrap().folders.ready;
        assert_eq!(entries(&ready).len(), 1, "expected one ready CSV");

        let ledger = IntakeLedger::new(dir.path().join("logs").join("intake_ledger.jsonl"));
        let records = ledger.load().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, TerminalOutcome::Archived);
        assert_eq!(records[0].client_id, "client_01");
        assert_eq!(records[0].path, inbox.join("orders.txt"));
    }

    #[tokio::test]
    async fn dropped_file_is_processed_end_to_end() {
        let dir = TempDir::new().unwrap();
        let config = sample_config(dir.path(), WatchBackend::Poll);
        let watches = build_client_watches(&config, None).unwrap();
        let inbox = watches[0].inbox().to_path_buf();
        let archive = watches[0].archive().to_path_buf();

        let handle = start_daemon(&config).await;
        fs::write(inbox.join("batch.txt"), BATCH).unwrap();
        wait_until("file to be archived", || {
            archive.join("batch.txt").exists()
        })
        .await;

        assert_eq!(handle.stats().archived(), 1);
        handle.stop().await;
        assert!(entries(&inbox).is_empty());
    }

    #[tokio::test]
    async fn failed_batch_lands_in_quarantine_with_error_file() {
        let dir = TempDir::new().unwrap();
        let config = sample_config(dir.path(), WatchBackend::Poll);
        let watches = build_client_watches(&config, None).unwrap();
        let inbox = watches[0].inbox().to_path_buf();
        let quarantine = watches[0].quarantine().to_path_buf();

        let handle = start_daemon(&config).await;
        fs::write(inbox.join("empty.txt"), "   \n\n").unwrap();
        wait_until("file to be quarantined", || {
            quarantine.join("empty.txt").exists()
        })
        .await;
        handle.stop().await;

        let detail = fs::read_to_string(quarantine.join("empty.error.txt")).unwrap();
        assert!(
            detail.contains("no valid records"),
            "unexpected detail: {detail}"
        );
        let ledger = IntakeLedger::new(dir.path().join("logs").join("intake_ledger.jsonl"));
        let records = ledger.load().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, TerminalOutcome::Quarantined);
    }

    #[tokio::test]
    async fn already_archived_name_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let config = sample_config(dir.path(), WatchBackend::Poll);
        let watches = build_client_watches(&config, None).unwrap();
        let inbox = watches[0].inbox().to_path_buf();
        let archive = watches[0].archive().to_path_buf();
        fs::write(archive.join("dup.txt"), b"done earlier").unwrap();

        let handle = start_daemon(&config).await;
        fs::write(inbox.join("dup.txt"), BATCH).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        handle.stop().await;

        assert_eq!(entries(&inbox), vec!["dup.txt"]);
        assert_eq!(entries(&archive), vec!["dup.txt"]);
        assert_eq!(fs::read(archive.join("dup.txt")).unwrap(), b"done earlier");
    }

    #[tokio::test]
    async fn ledger_survives_restart() {
        let dir = TempDir::new().unwrap();
        let config = sample_config(dir.path(), WatchBackend::Poll);
        let watches = build_client_watches(&config, None).unwrap();
        let inbox = watches[0].inbox().to_path_buf();
        let archive = watches[0].archive().to_path_buf();
        fs::write(inbox.join("orders.txt"), BATCH).unwrap();

        let handle = start_daemon(&config).await;
        wait_until("file to be archived", || {
            archive.join("orders.txt").exists()
        })
        .await;
        handle.stop().await;

        // Clear the archive so only the ledger remembers the outcome, then
        // drop a file at the same path again.
        fs::remove_file(archive.join("orders.txt")).unwrap();
        fs::write(inbox.join("orders.txt"), BATCH).unwrap();

        let handle = start_daemon(&config).await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        handle.stop().await;

        assert_eq!(entries(&inbox), vec!["orders.txt"]);
        assert!(entries(&archive).is_empty());
    }

    #[tokio::test]
    async fn worker_processes_in_arrival_order() {
        let dir = TempDir::new().unwrap();
        let config = sample_config(dir.path(), WatchBackend::Poll);
        let watches = build_client_watches(&config, None).unwrap();
        let inbox = watches[0].inbox().to_path_buf();
        let log_dir = dir.path().join("logs");
        fs::create_dir_all(&log_dir).unwrap();

        let ledger_file = IntakeLedger::new(log_dir.join("intake_ledger.jsonl"));
        let ctx = Arc::new(WorkerContext {
            clients: Arc::new(watches),
            ledger: Arc::new(ProcessedLedger::new(ledger_file.clone(), [])),
            options: PipelineOptions::default(),
            log_dir,
            stats: Arc::new(DaemonStats::default()),
        });

        let (tx, rx) = ingestion_queue();
        for name in ["a.txt", "b.txt", "c.txt"] {
            fs::write(inbox.join(name), BATCH).unwrap();
            assert!(tx.enqueue(inbox.join(name)));
        }
        drop(tx);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        worker_loop(rx, Arc::clone(&ctx), shutdown_rx).await;

        let names: Vec<String> = ledger_file
            .load()
            .unwrap()
            .into_iter()
            .map(|record| {
                record
                    .path
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "c.txt"]);
        assert_eq!(ctx.stats.archived(), 3);
    }

    #[tokio::test]
    async fn worker_drops_unroutable_and_vanished_paths() {
        let dir = TempDir::new().unwrap();
        let config = sample_config(dir.path(), WatchBackend::Poll);
        let watches = build_client_watches(&config, None).unwrap();
        let inbox = watches[0].inbox().to_path_buf();
        let log_dir = dir.path().join("logs");
        fs::create_dir_all(&log_dir).unwrap();

        let ledger_file = IntakeLedger::new(log_dir.join("intake_ledger.jsonl"));
        let ctx = Arc::new(WorkerContext {
            clients: Arc::new(watches),
            ledger: Arc::new(ProcessedLedger::new(ledger_file.clone(), [])),
            options: PipelineOptions::default(),
            log_dir,
            stats: Arc::new(DaemonStats::default()),
        });

        let (tx, rx) = ingestion_queue();
        assert!(tx.enqueue(dir.path().join("elsewhere").join("stray.txt")));
        assert!(tx.enqueue(inbox.join("never_written.txt")));
        drop(tx);

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        worker_loop(rx, Arc::clone(&ctx), shutdown_rx).await;

        // Neither path reached a terminal outcome or was marked processed.
        assert!(ledger_file.load().unwrap().is_empty());
        assert_eq!(ctx.stats.archived(), 0);
        assert_eq!(ctx.stats.quarantined(), 0);
    }
}
