//! Orchestrator: discovery producers feeding a bounded ingestion queue
//! drained by a fixed Gmail worker pool, with the state database as the
//! single source of truth in between.
//!
//! Per-message flow: header fetch -> filter -> body fetch -> fingerprint ->
//! dedupe gate -> evidence write -> `downloaded` -> queue -> Gmail ->
//! `imported`. Folder checkpoints only advance over the contiguous prefix
//! of fully processed UID batches, so a crash can cost re-work but never
//! skip a message.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, InternalDateSource};
use crate::errors::{MigResult, MigrateError};
use crate::evidence::EvidenceStore;
use crate::filter::{parse_header_summary, AddressFilter};
use crate::fingerprint::{normalize_message_id, Fingerprinter};
use crate::gmail::GmailClient;
use crate::imap::{self, HeaderFetch, ImapPool, MailboxEntry};
use crate::labels::map_folder;
use crate::retry::jittered_backoff;
use crate::storage::{StateDb, StatusCounts};
use crate::types::{CheckpointStatus, HeaderSummary, MessageStatus, Reservation, WorkItem};

/// Attempts per batch before the folder is marked errored.
const BATCH_ATTEMPTS: u32 = 3;
/// Per-row retry budget across the whole migration.
const MAX_ROW_RETRIES: i64 = 5;

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<Config>,
    db: StateDb,
    evidence: EvidenceStore,
    gmail: Option<Arc<GmailClient>>,
    fingerprinter: Fingerprinter,
    filter: AddressFilter,
    cancel: CancellationToken,
    /// Hierarchy delimiter per folder, captured from LIST so label mapping
    /// can normalize paths the way the server spells them.
    delimiters: Arc<Mutex<HashMap<String, Option<String>>>>,
}

impl Pipeline {
    /// `gmail: None` is dry-run: evidence and state are written, the
    /// ingestion queue and workers stay inert.
    pub fn new(
        config: Arc<Config>,
        db: StateDb,
        evidence: EvidenceStore,
        gmail: Option<Arc<GmailClient>>,
        cancel: CancellationToken,
    ) -> Self {
        let fingerprinter = Fingerprinter::new(config.storage.fingerprint_body_bytes);
        let filter = AddressFilter::new(&config.filter);
        Self {
            config,
            db,
            evidence,
            gmail,
            fingerprinter,
            filter,
            cancel,
            delimiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn run(&self, pool: ImapPool) -> MigResult<StatusCounts> {
        let (tx, rx) = mpsc::channel::<WorkItem>(self.config.concurrency.queue_maxsize);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        if let Some(gmail) = &self.gmail {
            for worker_id in 0..self.config.concurrency.gmail_workers {
                let pipeline = self.clone();
                let gmail = Arc::clone(gmail);
                let rx = Arc::clone(&rx);
                workers.spawn(async move {
                    pipeline.ingestion_worker(worker_id, gmail, rx).await;
                });
            }

            // Resume: rows stranded between evidence write and import by a
            // previous interruption go straight onto the queue.
            let pending = self.db.pending_imports().await?;
            if !pending.is_empty() {
                info!(count = pending.len(), "resuming pending imports");
            }
            for item in pending {
                if self.send_item(&tx, item).await.is_err() {
                    break;
                }
            }
        }

        let folders = self.discover_folders(&pool).await?;
        info!(folders = folders.len(), "discovery starting");

        let mut discovery = JoinSet::new();
        for entry in folders {
            let pipeline = self.clone();
            let pool = pool.clone();
            let tx = tx.clone();
            discovery.spawn(async move {
                let folder = entry.name.clone();
                if let Err(e) = pipeline.discover_folder(pool, tx, entry).await {
                    warn!(folder = %folder, error = %e, "folder discovery failed");
                }
            });
        }
        while discovery.join_next().await.is_some() {}

        // Closing the queue lets the workers drain and exit.
        drop(tx);
        while workers.join_next().await.is_some() {}

        if self.cancel.is_cancelled() {
            info!("pipeline interrupted, state committed up to the last finished item");
        }
        self.db.status_counts().await
    }

    async fn discover_folders(&self, pool: &ImapPool) -> MigResult<Vec<MailboxEntry>> {
        let mut session = pool_get(pool).await?;
        let entries = imap::list_folders(&mut session).await?;
        drop(session);

        let selected: Vec<MailboxEntry> = entries
            .into_iter()
            .filter(|e| self.config.imap.folder_selected(&e.name))
            .collect();

        let mut delimiters = self.delimiters.lock().await;
        for entry in &selected {
            delimiters.insert(entry.name.clone(), entry.delimiter.clone());
        }
        drop(delimiters);
        Ok(selected)
    }

    async fn discover_folder(
        &self,
        pool: ImapPool,
        tx: mpsc::Sender<WorkItem>,
        entry: MailboxEntry,
    ) -> MigResult<()> {
        let folder = entry.name.as_str();

        let (uidvalidity, exists, uids) = {
            let mut session = pool_get(&pool).await?;
            let snapshot = imap::select_folder(&mut session, folder).await?;

            self.db
                .invalidate_stale_checkpoints(folder, snapshot.uidvalidity)
                .await?;
            let last_uid = self
                .db
                .checkpoint(folder, snapshot.uidvalidity)
                .await?
                .map(|cp| cp.highest_uid_done)
                .unwrap_or(0);

            let uids: Vec<u32> = imap::uid_search(&mut session, &self.config.imap.search_query)
                .await?
                .into_iter()
                .filter(|uid| *uid > last_uid)
                .collect();
            (snapshot.uidvalidity, snapshot.exists, uids)
        };

        self.db
            .checkpoint_folder(
                folder,
                uidvalidity,
                0,
                Some(exists),
                CheckpointStatus::Scanning,
            )
            .await?;

        if uids.is_empty() {
            self.db
                .checkpoint_folder(folder, uidvalidity, 0, Some(exists), CheckpointStatus::Done)
                .await?;
            debug!(folder, uidvalidity, "nothing new to scan");
            return Ok(());
        }

        info!(folder, uidvalidity, new = uids.len(), "scanning folder");

        let batches: Vec<Vec<u32>> = uids
            .chunks(self.config.imap.batch_size)
            .map(|c| c.to_vec())
            .collect();
        let fanout = Arc::new(Semaphore::new(self.config.concurrency.imap_fetch_concurrency));

        let mut tasks: JoinSet<(usize, MigResult<u32>)> = JoinSet::new();
        for (index, batch) in batches.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            let pipeline = self.clone();
            let pool = pool.clone();
            let tx = tx.clone();
            let fanout = Arc::clone(&fanout);
            let folder = entry.name.clone();
            tasks.spawn(async move {
                let _permit = fanout.acquire().await.expect("fanout semaphore closed");
                let result = pipeline
                    .process_batch(&pool, &tx, &folder, uidvalidity, &batch)
                    .await;
                (index, result)
            });
        }

        // Checkpoints advance only over the contiguous prefix of finished
        // batches; a failed or cancelled batch freezes the frontier there.
        let mut results: BTreeMap<usize, MigResult<u32>> = BTreeMap::new();
        let mut frontier = 0usize;
        let mut frontier_blocked = false;
        let mut any_error = false;

        while let Some(joined) = tasks.join_next().await {
            let (index, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(folder, error = %e, "batch task panicked");
                    any_error = true;
                    continue;
                }
            };
            if let Err(e) = &result {
                if !matches!(e, MigrateError::Interrupted) {
                    warn!(folder, batch = index, error = %e, "batch failed");
                }
                any_error = true;
            }
            results.insert(index, result);

            while !frontier_blocked {
                match results.get(&frontier) {
                    Some(Ok(highest)) => {
                        self.db
                            .checkpoint_folder(
                                folder,
                                uidvalidity,
                                *highest,
                                Some(exists),
                                CheckpointStatus::Scanning,
                            )
                            .await?;
                        frontier += 1;
                    }
                    Some(Err(_)) => {
                        frontier_blocked = true;
                    }
                    None => break,
                }
            }
        }

        let final_status = if self.cancel.is_cancelled() {
            CheckpointStatus::Scanning
        } else if any_error {
            CheckpointStatus::Error
        } else {
            CheckpointStatus::Done
        };
        let final_highest = if final_status == CheckpointStatus::Done {
            uids.last().copied().unwrap_or(0)
        } else {
            0 // the upsert keeps the frontier's maximum
        };
        self.db
            .checkpoint_folder(folder, uidvalidity, final_highest, Some(exists), final_status)
            .await?;
        Ok(())
    }

    /// Fetches headers for one UID batch, runs the filter/dedupe gates,
    /// downloads passing bodies into evidence, and enqueues work items.
    /// Returns the batch's UID upper bound once every UID is accounted for.
    async fn process_batch(
        &self,
        pool: &ImapPool,
        tx: &mpsc::Sender<WorkItem>,
        folder: &str,
        uidvalidity: u32,
        uids: &[u32],
    ) -> MigResult<u32> {
        let mut attempt = 0u32;
        loop {
            match self
                .process_batch_once(pool, tx, folder, uidvalidity, uids)
                .await
            {
                Ok(highest) => return Ok(highest),
                Err(e) if e.is_retryable() && attempt + 1 < BATCH_ATTEMPTS => {
                    let delay = jittered_backoff(attempt);
                    warn!(
                        folder,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying batch"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn process_batch_once(
        &self,
        pool: &ImapPool,
        tx: &mpsc::Sender<WorkItem>,
        folder: &str,
        uidvalidity: u32,
        uids: &[u32],
    ) -> MigResult<u32> {
        let mut session = pool_get(pool).await?;

        // A pooled session may have another mailbox selected; reselect and
        // make sure the epoch did not move underneath the scan.
        let snapshot = imap::select_folder(&mut session, folder).await?;
        if snapshot.uidvalidity != uidvalidity {
            return Err(MigrateError::Imap(format!(
                "UIDVALIDITY changed mid-scan on {folder} ({uidvalidity} -> {})",
                snapshot.uidvalidity
            )));
        }

        let headers = imap::fetch_headers(&mut session, uids).await?;

        for fetched in headers {
            if self.cancel.is_cancelled() {
                return Err(MigrateError::Interrupted);
            }
            self.process_message(&mut session, tx, folder, uidvalidity, fetched)
                .await?;
        }

        Ok(*uids.last().unwrap_or(&0))
    }

    async fn process_message(
        &self,
        session: &mut imap::ImapSession,
        tx: &mpsc::Sender<WorkItem>,
        folder: &str,
        uidvalidity: u32,
        fetched: HeaderFetch,
    ) -> MigResult<()> {
        let uid = fetched.uid;

        let summary = match parse_header_summary(&fetched.header_bytes) {
            Ok(mut summary) => {
                summary.received_epoch = fetched.internal_date_epoch;
                summary
            }
            Err(e) => {
                // Unparseable headers are terminal for the message, not the
                // batch.
                warn!(folder, uid, error = %e, "skipping unparseable message");
                self.db
                    .record_skipped(folder, uid, uidvalidity, &HeaderSummary::default(), "parse-error")
                    .await?;
                return Ok(());
            }
        };

        if !self.filter.matches(&summary) {
            debug!(folder, uid, "filter miss");
            self.db
                .record_skipped(folder, uid, uidvalidity, &summary, "filtered")
                .await?;
            return Ok(());
        }

        let raw = imap::fetch_body(session, uid).await?;
        let fingerprint = self.fingerprinter.fingerprint(
            summary
                .message_id
                .as_deref()
                .and_then(normalize_message_id)
                .as_deref(),
            summary.date_epoch,
            summary.from.as_deref(),
            summary.subject.as_deref(),
            &raw,
        );

        let row_id = match self
            .db
            .reserve_discovery(folder, uid, uidvalidity, &fingerprint, &summary)
            .await?
        {
            Reservation::New { row_id } => row_id,
            Reservation::Resumed { row_id, status } => {
                if status != MessageStatus::Discovered {
                    debug!(folder, uid, status = status.as_str(), "row already past discovery");
                    return Ok(());
                }
                row_id
            }
            Reservation::Duplicate => {
                debug!(folder, uid, fingerprint = %fingerprint, "duplicate suppressed");
                return Ok(());
            }
        };

        let stored = match self.evidence.store(&fingerprint, &raw) {
            Ok(stored) => stored,
            Err(e @ MigrateError::EvidenceCorruption { .. }) => {
                warn!(folder, uid, error = %e, "evidence corruption, failing row");
                self.db
                    .record_failure(row_id, e.kind(), true, MAX_ROW_RETRIES)
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.db
            .record_downloaded(row_id, &stored.relative_path, &stored.sha256, stored.size)
            .await?;
        debug!(folder, uid, fingerprint = %fingerprint, bytes = stored.size, "downloaded");

        if self.gmail.is_some() {
            self.send_item(
                tx,
                WorkItem {
                    row_id,
                    fingerprint,
                    folder: folder.to_string(),
                    evidence_path: stored.relative_path,
                    date_epoch: summary.date_epoch,
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Enqueues with backpressure; a full queue blocks discovery instead of
    /// growing memory. Cancellation wins over a blocked send.
    async fn send_item(&self, tx: &mpsc::Sender<WorkItem>, item: WorkItem) -> MigResult<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(MigrateError::Interrupted),
            sent = tx.send(item) => {
                sent.map_err(|_| MigrateError::Interrupted)
            }
        }
    }

    async fn ingestion_worker(
        &self,
        worker_id: usize,
        gmail: Arc<GmailClient>,
        rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    ) {
        loop {
            let item = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(item) = item else {
                debug!(worker_id, "ingestion queue closed, worker exiting");
                return;
            };
            match self.ingest_item(&gmail, &item).await {
                Ok(()) | Err(MigrateError::Interrupted) => {}
                Err(e) => {
                    warn!(worker_id, fingerprint = %item.fingerprint, error = %e, "ingestion gave up");
                }
            }
        }
    }

    async fn ingest_item(&self, gmail: &GmailClient, item: &WorkItem) -> MigResult<()> {
        // A resumed queue can hand us a row a previous run already imported.
        match self.db.row_status(item.row_id).await? {
            Some(MessageStatus::Downloaded) => {}
            other => {
                debug!(row = item.row_id, status = ?other, "skipping non-pending work item");
                return Ok(());
            }
        }

        let raw = match self.evidence.load(&item.evidence_path) {
            Ok(raw) => raw,
            Err(e) => {
                self.db
                    .record_failure(item.row_id, e.kind(), true, MAX_ROW_RETRIES)
                    .await?;
                return Err(e);
            }
        };

        let delimiter = self
            .delimiters
            .lock()
            .await
            .get(&item.folder)
            .cloned()
            .flatten();
        let mapping = map_folder(&item.folder, delimiter.as_deref(), &self.config.gmail.label_prefix);

        // Open question resolved: a message with no parseable Date cannot
        // honor internalDateSource=dateHeader, so it falls back to
        // receivedTime and the row notes the substitution.
        let (date_source, note) = match self.config.gmail.internal_date_source {
            InternalDateSource::DateHeader if item.date_epoch.is_none() => (
                InternalDateSource::ReceivedTime,
                Some("internalDate fell back to receivedTime: no parseable Date header"),
            ),
            source => (source, None),
        };

        let mut attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() && attempt > 0 {
                // Mid-retry cancellation: the row stays `downloaded` and the
                // next run resumes it.
                return Err(MigrateError::Interrupted);
            }

            let outcome = async {
                let label_ids = gmail.resolve_labels(&mapping).await?;
                gmail.ingest(&raw, &label_ids, date_source).await
            }
            .await;

            match outcome {
                Ok(remote_id) => {
                    let committed = self.db.record_imported(item.row_id, &remote_id, note).await?;
                    if committed {
                        info!(fingerprint = %item.fingerprint, remote_id = %remote_id, "imported");
                    } else {
                        warn!(
                            fingerprint = %item.fingerprint,
                            "import gate refused commit; row was not in `downloaded`"
                        );
                    }
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    let kind = e.kind();
                    let after = match &e {
                        MigrateError::Quota { retry_after } => *retry_after,
                        _ => None,
                    };
                    let status = self
                        .db
                        .record_failure(item.row_id, kind, false, MAX_ROW_RETRIES)
                        .await?;
                    if status == MessageStatus::Failed {
                        return Err(e);
                    }
                    let delay = after.unwrap_or_else(|| jittered_backoff(attempt));
                    debug!(
                        fingerprint = %item.fingerprint,
                        kind = kind.as_str(),
                        delay_ms = delay.as_millis() as u64,
                        "transient ingest failure, backing off"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(MigrateError::Interrupted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    self.db
                        .record_failure(item.row_id, e.kind(), true, MAX_ROW_RETRIES)
                        .await?;
                    return Err(e);
                }
            }
        }
    }
}

async fn pool_get(
    pool: &ImapPool,
) -> MigResult<deadpool::managed::Object<crate::imap::ImapManager>> {
    pool.get().await.map_err(|e| match e {
        deadpool::managed::PoolError::Backend(inner) => inner,
        other => MigrateError::Unexpected(format!("imap pool error: {other}")),
    })
}
