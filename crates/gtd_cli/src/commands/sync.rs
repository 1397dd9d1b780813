//! Sync command implementation.

use super::{CliResult, Context};
use gtd_core::{fold, DocumentModel, Notification, StoreConfig};
use gtd_sync_engine::{ChannelTransport, ReplicaApplier, SyncEngine};
use std::sync::Arc;
use std::time::Duration;

/// Runs the sync command.
///
/// Without a configured server this prints a notice and succeeds.
pub fn run(context: &Context, watch: bool) -> CliResult<()> {
    let Some(config) = context.settings.sync_config() else {
        println!("Sync disabled: no server configured");
        return Ok(());
    };
    if watch {
        return watch_forever(context);
    }

    let dir = context.open_dir()?;
    let store = Arc::new(dir.open_store(StoreConfig::default())?);
    let model = Arc::new(DocumentModel::with_document(fold(&store.all_commands())));
    let pin = context.settings.pinned_certificate(&config)?;
    let transport = ChannelTransport::new(&config, Arc::new(pin));
    let applier = ReplicaApplier::new(model, Arc::clone(&store));
    let engine = SyncEngine::new(config, transport, applier);

    let result = engine.sync()?;
    println!(
        "Uploaded {}, downloaded {}, applied {} ({} pending)",
        result.uploaded,
        result.downloaded,
        result.applied,
        store.pending_count()
    );
    Ok(())
}

/// Syncs now, then on every interval and retry, until killed.
fn watch_forever(context: &Context) -> CliResult<()> {
    let replica = context.open_online()?;
    let notifications = replica.service.subscribe();
    replica.service.request_sync(Duration::ZERO);

    for notification in notifications {
        match notification {
            Notification::StateChanged => {
                tracing::info!(
                    pending = replica.service.store().pending_count(),
                    "Document updated"
                );
            }
            Notification::SyncError(message) => {
                tracing::warn!(%message, "Sync failed");
            }
        }
    }
    Ok(())
}
