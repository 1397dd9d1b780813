//! Listing commands.

use super::{CliResult, Context};
use gtd_core::{encode_num, AnnotatedCommand, Mutation, Tag};
use serde::Serialize;

/// One pending command, as shown to the user.
#[derive(Debug, Serialize)]
pub struct PendingView {
    /// Local sequence id.
    pub sequence_id: u64,
    /// Opcode character.
    pub opcode: char,
    /// Decoded payload, or the raw bytes if malformed.
    pub payload: String,
    /// Creation time, milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl From<&AnnotatedCommand> for PendingView {
    fn from(entry: &AnnotatedCommand) -> Self {
        let command = &entry.command;
        let payload = match command.decode() {
            Ok(Mutation::DeleteItem { num }) => encode_num(num),
            Ok(Mutation::DeleteTag { tag }) => tag,
            Ok(Mutation::SetTitle { num, title }) => format!("{} {title}", encode_num(num)),
            Ok(Mutation::TagItem { num, tag }) => format!("{} {tag}", encode_num(num)),
            Err(_) => String::from_utf8_lossy(&command.payload).into_owned(),
        };
        Self {
            sequence_id: command.sequence_id,
            opcode: char::from(command.opcode),
            payload,
            timestamp: entry.timestamp,
        }
    }
}

/// Runs `tags`.
pub fn tags(context: &Context, format: &str) -> CliResult<()> {
    let replica = context.open_offline()?;
    let tags = replica.service.tags();
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&tags)?),
        _ => print_tags(&tags),
    }
    Ok(())
}

fn print_tags(tags: &[Tag]) {
    let width = tags.iter().map(|t| t.title.len()).max().unwrap_or(0);
    for tag in tags {
        println!("{:<width$}  {}", tag.title, tag.count);
    }
}

/// Runs `items`.
pub fn items(context: &Context, tag: &str, format: &str) -> CliResult<()> {
    let replica = context.open_offline()?;
    let items = replica.service.items(tag);
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&items)?),
        _ => {
            for item in &items {
                println!("{}  {}", encode_num(item.num), item.title);
            }
        }
    }
    Ok(())
}

/// Runs `pending`.
pub fn pending(context: &Context, format: &str) -> CliResult<()> {
    let replica = context.open_offline()?;
    let pending: Vec<PendingView> = replica
        .service
        .store()
        .pending()
        .iter()
        .map(PendingView::from)
        .collect();
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&pending)?),
        _ => {
            for view in &pending {
                println!("{:>6}  {}  {}", view.sequence_id, view.opcode, view.payload);
            }
            println!("{} pending", pending.len());
        }
    }
    Ok(())
}
