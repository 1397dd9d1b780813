//! Serve command implementation.

use super::CliResult;
use gtd_sync_server::{CredentialStore, ServerConfig, SyncServer, TlsIdentity};
use std::net::SocketAddr;
use std::path::Path;

/// Runs the reference server until Ctrl-C.
pub fn run(
    bind: SocketAddr,
    cert: &Path,
    key: &Path,
    users: Vec<(String, String)>,
) -> CliResult<()> {
    let mut credentials = CredentialStore::new();
    for (name, password) in users {
        credentials.add_user(name, &password);
    }
    let identity = TlsIdentity::from_der_files(cert, key)?;
    let server = SyncServer::new(ServerConfig::new(bind), credentials);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        tokio::select! {
            result = server.run(identity) => result.map_err(Into::into),
            signal = tokio::signal::ctrl_c() => {
                tracing::info!(commands = server.command_count(), "Shutting down");
                signal.map_err(Into::into)
            }
        }
    })
}
