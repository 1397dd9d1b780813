//! Compact command implementation.

use super::{CliResult, Context};
use gtd_core::StoreConfig;

/// Runs the compact command.
pub fn run(context: &Context) -> CliResult<()> {
    let dir = context.open_dir()?;
    let path = dir.commands_path();
    let store = dir.open_store(StoreConfig::default())?;

    let before = std::fs::metadata(&path)?.len();
    store.compact()?;
    let after = std::fs::metadata(&path)?.len();

    println!("Compacted {}", path.display());
    println!("  Commands:    {}", store.len());
    println!("  Pending:     {}", store.pending_count());
    println!("  Size before: {before} bytes");
    println!("  Size after:  {after} bytes");
    Ok(())
}
