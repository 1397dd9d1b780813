//! Local change commands.
//!
//! Each records one batch in the command log and applies it. Nothing is
//! sent until `gtd sync`.

use super::{CliResult, Context};
use gtd_core::{encode_num, format_date};
use time::Date;

/// Runs `add`.
pub fn add(context: &Context, title: &str, tag: &str) -> CliResult<()> {
    let replica = context.open_offline()?;
    let num = replica.service.add_item(title, tag)?;
    println!("{}", encode_num(num));
    Ok(())
}

/// Runs `title`.
pub fn set_title(context: &Context, num: u32, title: &str) -> CliResult<()> {
    let replica = context.open_offline()?;
    replica.service.set_title(num, title)?;
    Ok(())
}

/// Runs `tag`.
pub fn tag(context: &Context, num: u32, tag: &str) -> CliResult<()> {
    let replica = context.open_offline()?;
    require_item(&replica, num)?;
    replica.service.tag_item(num, tag)?;
    Ok(())
}

/// Runs `defer`.
pub fn defer(context: &Context, num: u32, date: Date) -> CliResult<()> {
    let replica = context.open_offline()?;
    require_item(&replica, num)?;
    replica.service.defer_item(num, date)?;
    println!("{} deferred until {}", encode_num(num), format_date(date));
    Ok(())
}

/// Runs `rm`.
pub fn remove(context: &Context, num: u32) -> CliResult<()> {
    let replica = context.open_offline()?;
    require_item(&replica, num)?;
    replica.service.delete_item(num)?;
    Ok(())
}

/// Runs `rm-tag`.
pub fn remove_tag(context: &Context, tag: &str) -> CliResult<()> {
    let replica = context.open_offline()?;
    if !replica.service.model().snapshot().has_tag(tag) {
        return Err(format!("no such tag: {tag}").into());
    }
    replica.service.delete_tag(tag)?;
    Ok(())
}

fn require_item(replica: &super::Replica, num: u32) -> CliResult<()> {
    if replica.service.model().contains_item(num) {
        Ok(())
    } else {
        Err(format!("no such item: {}", encode_num(num)).into())
    }
}
