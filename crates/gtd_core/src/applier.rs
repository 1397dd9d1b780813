//! The command applier.
//!
//! A pure state transition: `(document, command) -> document'`. Every
//! opcode is idempotent so at-least-once delivery from sync cannot corrupt
//! state, and a bad command is skipped and logged rather than aborting the
//! fold.

use crate::command::{Command, Mutation};
use crate::document::{Document, BUILTIN_TAGS};

/// What happened to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The command was applied (possibly as a no-op).
    Applied,
    /// The command was skipped.
    Skipped {
        /// Human-readable reason.
        reason: String,
    },
}

/// Summary of applying a sequence of commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Commands applied.
    pub applied: usize,
    /// Commands skipped.
    pub skipped: usize,
}

impl ApplyReport {
    fn record(&mut self, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied => self.applied += 1,
            ApplyOutcome::Skipped { .. } => self.skipped += 1,
        }
    }
}

/// Applies one command.
pub fn apply(document: &mut Document, command: &Command) -> ApplyOutcome {
    let mutation = match command.decode() {
        Ok(mutation) => mutation,
        Err(err) => return skip(command, err.to_string()),
    };

    match mutation {
        Mutation::DeleteItem { num } => {
            document.remove_item(num);
        }
        Mutation::DeleteTag { tag } => {
            if BUILTIN_TAGS.contains(&tag.as_str()) {
                return skip(command, format!("built-in tag {tag:?} cannot be deleted"));
            }
            document.remove_tag(&tag);
        }
        Mutation::SetTitle { num, title } => document.set_title(num, title),
        Mutation::TagItem { num, tag } => document.tag_item(num, tag),
    }
    ApplyOutcome::Applied
}

/// Applies commands strictly in the given order.
pub fn apply_all<'a>(
    document: &mut Document,
    commands: impl IntoIterator<Item = &'a Command>,
) -> ApplyReport {
    let mut report = ApplyReport::default();
    for command in commands {
        report.record(&apply(document, command));
    }
    report
}

/// Folds a full history into a fresh document.
pub fn fold<'a>(commands: impl IntoIterator<Item = &'a Command>) -> Document {
    let mut document = Document::new();
    apply_all(&mut document, commands);
    document
}

fn skip(command: &Command, reason: String) -> ApplyOutcome {
    tracing::warn!(
        origin_id = command.origin_id,
        sequence_id = command.sequence_id,
        opcode = %char::from(command.opcode),
        %reason,
        "Skipping command"
    );
    ApplyOutcome::Skipped { reason }
}
