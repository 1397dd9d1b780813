//! Lock-guarded access to the document.

use crate::applier::{apply, apply_all, ApplyOutcome, ApplyReport};
use crate::command::Command;
use crate::document::{Document, Item, Tag};
use crate::notify::{Notification, NotificationFeed};
use crate::tickler::today;
use parking_lot::Mutex;
use std::sync::mpsc::Receiver;
use time::Date;

/// The live document plus its observers.
///
/// One mutex guards every read and write. Snapshots hand out deep copies so
/// the lock is never held by a caller, and never across network I/O.
#[derive(Debug, Default)]
pub struct DocumentModel {
    document: Mutex<Document>,
    feed: NotificationFeed,
}

impl DocumentModel {
    /// Creates a model holding the initial document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a model from an already folded document.
    pub fn with_document(document: Document) -> Self {
        Self {
            document: Mutex::new(document),
            feed: NotificationFeed::new(),
        }
    }

    /// Applies one command, then optionally notifies observers.
    pub fn evaluate(&self, command: &Command, notify: bool) -> ApplyOutcome {
        let outcome = {
            let mut document = self.document.lock();
            apply(&mut document, command)
        };
        if notify {
            self.feed.emit(Notification::StateChanged);
        }
        outcome
    }

    /// Applies a batch under a single lock acquisition.
    ///
    /// Observers see the document before or after the batch, never between.
    pub fn evaluate_batch(&self, commands: &[Command], notify: bool) -> ApplyReport {
        let report = {
            let mut document = self.document.lock();
            apply_all(&mut document, commands)
        };
        if notify {
            self.feed.emit(Notification::StateChanged);
        }
        report
    }

    /// Persists a batch and applies it under one lock acquisition.
    ///
    /// `persist` sees the current document, writes the commands it decides
    /// on and returns them as stored; those are then applied. Holding the
    /// lock across both keeps the application order identical to the
    /// stored order. If `persist` fails the document is untouched.
    ///
    /// # Errors
    ///
    /// Returns whatever `persist` returns.
    pub fn evaluate_persisted<E>(
        &self,
        notify: bool,
        persist: impl FnOnce(&Document) -> Result<Vec<Command>, E>,
    ) -> Result<ApplyReport, E> {
        let report = {
            let mut document = self.document.lock();
            let stored = persist(&document)?;
            if stored.is_empty() {
                return Ok(ApplyReport::default());
            }
            apply_all(&mut document, &stored)
        };
        if notify {
            self.feed.emit(Notification::StateChanged);
        }
        Ok(report)
    }

    /// Tags with counts derived for today's date.
    pub fn snapshot_tags(&self) -> Vec<Tag> {
        self.snapshot_tags_on(today())
    }

    /// Tags with counts derived for `date`.
    pub fn snapshot_tags_on(&self, date: Date) -> Vec<Tag> {
        self.document.lock().tags_on(date)
    }

    /// Items listed under `tag` today.
    pub fn snapshot_items(&self, tag: &str) -> Vec<Item> {
        self.snapshot_items_on(tag, today())
    }

    /// Items listed under `tag` on `date`.
    pub fn snapshot_items_on(&self, tag: &str, date: Date) -> Vec<Item> {
        self.document.lock().items_on(tag, date)
    }

    /// Title of item `num`, if it exists.
    pub fn item_title(&self, num: u32) -> Option<String> {
        self.document.lock().item(num).map(|item| item.title.clone())
    }

    /// Returns true if item `num` exists.
    pub fn contains_item(&self, num: u32) -> bool {
        self.document.lock().item(num).is_some()
    }

    /// A full copy of the document.
    pub fn snapshot(&self) -> Document {
        self.document.lock().clone()
    }

    /// Subscribes to notifications.
    pub fn subscribe(&self) -> Receiver<Notification> {
        self.feed.subscribe()
    }

    /// Emits a sync-error notification.
    pub fn notify_sync_error(&self, message: impl Into<String>) {
        self.feed.emit(Notification::SyncError(message.into()));
    }

    /// Emits a state-changed notification.
    pub fn notify_state_changed(&self) {
        self.feed.emit(Notification::StateChanged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{INBOX, TICKLER};
    use std::sync::Arc;
    use std::thread;
    use time::Month;

    #[test]
    fn evaluate_notifies_only_when_asked() {
        let model = DocumentModel::new();
        let rx = model.subscribe();

        model.evaluate(&Command::set_title(1, "quiet"), false);
        assert!(rx.try_recv().is_err());

        model.evaluate(&Command::set_title(2, "loud"), true);
        assert_eq!(rx.try_recv().unwrap(), Notification::StateChanged);
        assert_eq!(model.item_title(1).as_deref(), Some("quiet"));
    }

    #[test]
    fn batch_emits_one_notification() {
        let model = DocumentModel::new();
        let rx = model.subscribe();

        let report = model.evaluate_batch(
            &[Command::set_title(9, "plan trip"), Command::tag_item(9, "someday")],
            true,
        );
        assert_eq!(report.applied, 2);
        assert_eq!(rx.try_recv().unwrap(), Notification::StateChanged);
        assert!(rx.try_recv().is_err());
        assert_eq!(model.snapshot_items("someday").len(), 1);
    }

    #[test]
    fn snapshot_counts_on_a_fixed_date() {
        let model = DocumentModel::new();
        model.evaluate_batch(
            &[
                Command::set_title(1, "renew passport"),
                Command::tag_item(1, "tickler:2099-01-01"),
                Command::set_title(2, "buy milk"),
                Command::tag_item(2, INBOX),
            ],
            false,
        );

        let before = Date::from_calendar_date(2098, Month::December, 31).unwrap();
        let tags = model.snapshot_tags_on(before);
        let count = |name: &str| tags.iter().find(|t| t.title == name).unwrap().count;
        assert_eq!((count(INBOX), count(TICKLER)), (1, 1));

        let after = Date::from_calendar_date(2099, Month::January, 1).unwrap();
        let tags = model.snapshot_tags_on(after);
        let count = |name: &str| tags.iter().find(|t| t.title == name).unwrap().count;
        assert_eq!((count(INBOX), count(TICKLER)), (2, 0));
        assert_eq!(model.snapshot_items_on(INBOX, after).len(), 2);
    }

    #[test]
    fn failed_persist_leaves_document_untouched() {
        let model = DocumentModel::new();
        let rx = model.subscribe();

        let result: Result<ApplyReport, &str> =
            model.evaluate_persisted(true, |_| Err("disk full"));
        assert_eq!(result, Err("disk full"));
        assert_eq!(model.snapshot(), Document::new());
        assert!(rx.try_recv().is_err());

        let report = model
            .evaluate_persisted::<()>(true, |doc| {
                assert_eq!(doc.item_count(), 0);
                Ok(vec![Command::set_title(4, "stored")])
            })
            .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(rx.try_recv().unwrap(), Notification::StateChanged);
    }

    #[test]
    fn nothing_persisted_means_no_notification() {
        let model = DocumentModel::new();
        let rx = model.subscribe();
        model
            .evaluate_persisted::<()>(true, |_| Ok(Vec::new()))
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn concurrent_writers_serialize() {
        let model = Arc::new(DocumentModel::new());
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let model = Arc::clone(&model);
                thread::spawn(move || {
                    for i in 0..50u32 {
                        model.evaluate(&Command::set_title(t * 100 + i + 1, "x"), false);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(model.snapshot().item_count(), 200);
    }
}
