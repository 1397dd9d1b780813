//! The replica service.
//!
//! [`GtdService`] owns the document, the command store and (when a server
//! is configured) the sync engine. User actions run on the caller's thread;
//! sync rounds run on one dedicated worker thread fed by a FIFO queue.
//!
//! ```text
//! action ──► store.append + apply ──► request_sync(0) ──► queue ──► worker ──► engine.sync()
//!                                     request_sync(d) ──► timer ─┘
//! ```
//!
//! There is at most one armed timer. Arming it again keeps whichever
//! deadline comes first, so periodic and retry wakes never multiply.

use crate::config::{RetryConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::state::{ReplicaApplier, SyncEngine, SyncState};
use crate::transport::SyncTransport;
use gtd_core::{
    deferred_tag, fold, generate_num, AnnotatedCommand, Command, CommandStore, DocumentModel,
    Item, Notification, Tag, INBOX, MAX_NUM,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use time::Date;

enum Task {
    Sync,
    Shutdown,
}

#[derive(Clone, Copy)]
struct ArmedTimer {
    generation: u64,
    due: Instant,
}

struct Shared<T: SyncTransport> {
    model: Arc<DocumentModel>,
    store: Arc<CommandStore>,
    engine: Option<SyncEngine<T, ReplicaApplier>>,
    retry: RetryConfig,
    interval: Option<Duration>,
    queue: Mutex<Option<Sender<Task>>>,
    queued: AtomicBool,
    failures: AtomicU32,
    timer: Mutex<Option<ArmedTimer>>,
    timer_generation: AtomicU64,
}

impl<T: SyncTransport + 'static> Shared<T> {
    /// Puts one sync task on the queue unless one is already waiting.
    fn enqueue(&self) {
        if self.queued.swap(true, Ordering::SeqCst) {
            tracing::trace!("Sync already queued");
            return;
        }
        let sent = match self.queue.lock().as_ref() {
            Some(tx) => tx.send(Task::Sync).is_ok(),
            None => false,
        };
        if !sent {
            self.queued.store(false, Ordering::SeqCst);
        }
    }

    fn schedule(self: &Arc<Self>, delay: Duration) {
        if delay.is_zero() {
            self.enqueue();
            return;
        }
        let due = Instant::now() + delay;
        let generation = {
            let mut timer = self.timer.lock();
            if let Some(armed) = *timer {
                if armed.due <= due {
                    tracing::trace!("Earlier sync timer already armed");
                    return;
                }
            }
            let generation = self.timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
            *timer = Some(ArmedTimer { generation, due });
            generation
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name("gtd-sync-timer".into())
            .spawn(move || {
                thread::sleep(delay);
                if let Some(shared) = weak.upgrade() {
                    shared.fire_timer(generation);
                }
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "Could not start sync timer");
            let mut timer = self.timer.lock();
            if timer.is_some_and(|armed| armed.generation == generation) {
                *timer = None;
            }
        }
    }

    /// Enqueues a round if `generation` is still the armed timer.
    fn fire_timer(&self, generation: u64) {
        {
            let mut timer = self.timer.lock();
            match *timer {
                Some(armed) if armed.generation == generation => *timer = None,
                _ => return,
            }
        }
        self.enqueue();
    }

    fn run_round(self: &Arc<Self>) {
        let Some(engine) = &self.engine else {
            return;
        };
        match engine.sync() {
            Ok(_) => {
                self.failures.store(0, Ordering::SeqCst);
                if let Some(interval) = self.interval {
                    self.schedule(interval);
                }
            }
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
                let delay = self.retry.delay_for_attempt(failures);
                tracing::warn!(
                    failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "Sync will be retried"
                );
                self.model.notify_sync_error(e.to_string());
                self.schedule(delay);
            }
        }
    }
}

/// An explicitly constructed, owned GTD replica.
///
/// Dropping the service stops the worker after any round in flight.
pub struct GtdService<T: SyncTransport + 'static> {
    shared: Arc<Shared<T>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: SyncTransport + 'static> GtdService<T> {
    /// Starts a replica over `store`.
    ///
    /// The document is rebuilt by folding the store's full history. With
    /// `sync` set to `None` every sync request is a silent no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be started.
    pub fn start(store: CommandStore, sync: Option<(SyncConfig, T)>) -> SyncResult<Self> {
        let store = Arc::new(store);
        let history = store.all_commands();
        let model = Arc::new(DocumentModel::with_document(fold(&history)));
        tracing::info!(
            commands = history.len(),
            pending = store.pending_count(),
            sync = sync.is_some(),
            "Replica loaded"
        );

        let (retry, interval, engine) = match sync {
            Some((config, transport)) => {
                let applier = ReplicaApplier::new(Arc::clone(&model), Arc::clone(&store));
                (
                    config.retry.clone(),
                    config.sync_interval,
                    Some(SyncEngine::new(config, transport, applier)),
                )
            }
            None => (RetryConfig::default(), None, None),
        };

        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            model,
            store,
            engine,
            retry,
            interval,
            queue: Mutex::new(Some(tx)),
            queued: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            timer: Mutex::new(None),
            timer_generation: AtomicU64::new(0),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("gtd-sync-worker".into())
            .spawn(move || worker_loop(&worker_shared, &rx))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Asks for a sync round after `delay`.
    ///
    /// Zero means as soon as the worker is free. A request arriving while
    /// another is still queued is merged with it; a delayed request later
    /// than the armed timer is dropped. Without a configured server this
    /// does nothing.
    pub fn request_sync(&self, delay: Duration) {
        if self.shared.engine.is_none() {
            return;
        }
        self.shared.schedule(delay);
    }

    /// Whether a server is configured.
    pub fn sync_enabled(&self) -> bool {
        self.shared.engine.is_some()
    }

    /// Current sync state; `Idle` when sync is disabled.
    pub fn sync_state(&self) -> SyncState {
        self.shared
            .engine
            .as_ref()
            .map_or(SyncState::Idle, SyncEngine::state)
    }

    /// Persists and applies `commands` as one batch, then requests a sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be stored; the document is then
    /// unchanged.
    pub fn submit(&self, commands: Vec<Command>) -> SyncResult<()> {
        self.submit_with(|_| commands)?;
        Ok(())
    }

    fn submit_with(
        &self,
        build: impl FnOnce(&gtd_core::Document) -> Vec<Command>,
    ) -> SyncResult<Vec<Command>> {
        let store = &self.shared.store;
        let mut recorded = Vec::new();
        self.shared.model.evaluate_persisted(true, |document| {
            let batch = build(document)
                .into_iter()
                .map(AnnotatedCommand::new)
                .collect();
            let stored: Vec<Command> = store
                .append(batch, true)?
                .into_iter()
                .map(|c| c.command)
                .collect();
            recorded.clone_from(&stored);
            Ok::<_, crate::SyncError>(stored)
        })?;
        self.request_sync(Duration::ZERO);
        Ok(recorded)
    }

    /// Creates an item and returns its number.
    ///
    /// The item lands in `tag`; `inbox` needs no extra command.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch cannot be stored.
    pub fn add_item(&self, title: &str, tag: &str) -> SyncResult<u32> {
        let mut num = 0;
        self.submit_with(|document| {
            num = generate_num(|n| document.item(n).is_some());
            let mut batch = vec![Command::set_title(num, title)];
            if tag != INBOX {
                batch.push(Command::tag_item(num, tag));
            }
            batch
        })?;
        Ok(num)
    }

    /// Renames an item (or creates it under `num`).
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidArgument`] if `num` is outside
    /// `1..=MAX_NUM`, or an error if the command cannot be stored.
    pub fn set_title(&self, num: u32, title: &str) -> SyncResult<()> {
        check_num(num)?;
        self.submit(vec![Command::set_title(num, title)])
    }

    /// Moves an item to `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidArgument`] for an out-of-range `num` or
    /// an empty tag, or an error if the command cannot be stored.
    pub fn tag_item(&self, num: u32, tag: &str) -> SyncResult<()> {
        check_num(num)?;
        check_tag(tag)?;
        self.submit(vec![Command::tag_item(num, tag)])
    }

    /// Parks an item in the tickler until `date`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidArgument`] for an out-of-range `num`, or
    /// an error if the command cannot be stored.
    pub fn defer_item(&self, num: u32, date: Date) -> SyncResult<()> {
        check_num(num)?;
        self.submit(vec![Command::tag_item(num, &deferred_tag(date))])
    }

    /// Deletes an item.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidArgument`] for an out-of-range `num`, or
    /// an error if the command cannot be stored.
    pub fn delete_item(&self, num: u32) -> SyncResult<()> {
        check_num(num)?;
        self.submit(vec![Command::delete_item(num)])
    }

    /// Deletes a user tag. Items keep the tag and list under `inbox`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidArgument`] for an empty name, or an
    /// error if the command cannot be stored.
    pub fn delete_tag(&self, name: &str) -> SyncResult<()> {
        check_tag(name)?;
        self.submit(vec![Command::delete_tag(name)])
    }

    /// Tags with today's counts.
    pub fn tags(&self) -> Vec<Tag> {
        self.shared.model.snapshot_tags()
    }

    /// Items listed under `tag` today.
    pub fn items(&self, tag: &str) -> Vec<Item> {
        self.shared.model.snapshot_items(tag)
    }

    /// Title of item `num`.
    pub fn item_title(&self, num: u32) -> Option<String> {
        self.shared.model.item_title(num)
    }

    /// Subscribes to notifications.
    pub fn subscribe(&self) -> Receiver<Notification> {
        self.shared.model.subscribe()
    }

    /// The live document.
    pub fn model(&self) -> &Arc<DocumentModel> {
        &self.shared.model
    }

    /// The command store.
    pub fn store(&self) -> &Arc<CommandStore> {
        &self.shared.store
    }

    /// Stops the worker, waiting for a round in flight to finish.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shared.queue.lock().take() {
            let _ = tx.send(Task::Shutdown);
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Sync worker panicked");
            }
        }
    }
}

impl<T: SyncTransport + 'static> Drop for GtdService<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check_num(num: u32) -> SyncResult<()> {
    if num == 0 || num > MAX_NUM {
        return Err(SyncError::InvalidArgument(format!(
            "item number {num} outside 1..={MAX_NUM}"
        )));
    }
    Ok(())
}

fn check_tag(tag: &str) -> SyncResult<()> {
    if tag.is_empty() {
        return Err(SyncError::InvalidArgument("empty tag name".into()));
    }
    Ok(())
}

fn worker_loop<T: SyncTransport + 'static>(shared: &Arc<Shared<T>>, rx: &Receiver<Task>) {
    tracing::debug!("Sync worker started");
    while let Ok(task) = rx.recv() {
        match task {
            Task::Sync => {
                shared.queued.store(false, Ordering::SeqCst);
                shared.run_round();
            }
            Task::Shutdown => break,
        }
    }
    tracing::debug!("Sync worker stopped");
}
