//! CLI command implementations.

pub mod compact;
pub mod list;
pub mod local;
pub mod serve;
pub mod sync;

use gtd_core::{parse_date, DataDir, StoreConfig, MAX_NUM};
use gtd_sync_engine::{ChannelTransport, ClientSettings, GtdService};
use std::path::{Path, PathBuf};
use time::Date;

/// Result type for commands.
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

const DEFAULT_DATA_DIR: &str = ".gtd";

/// Settings and paths shared by every command.
#[derive(Debug)]
pub struct Context {
    /// Parsed settings file, or defaults.
    pub settings: ClientSettings,
    /// Replica data directory.
    pub data_dir: PathBuf,
}

/// An open, locked replica.
///
/// Field order matters: the service stops before the lock is released.
pub struct Replica {
    /// The replica service.
    pub service: GtdService<ChannelTransport>,
    _dir: DataDir,
}

impl Context {
    /// Loads settings and resolves the data directory.
    pub fn new(config: Option<&Path>, data_dir: Option<PathBuf>) -> CliResult<Self> {
        let settings = match config {
            Some(path) => ClientSettings::load(path)?,
            None => ClientSettings::default(),
        };
        let data_dir = data_dir
            .or_else(|| settings.data_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        Ok(Self { settings, data_dir })
    }

    /// Locks the data directory.
    pub fn open_dir(&self) -> CliResult<DataDir> {
        Ok(DataDir::open(&self.data_dir)?)
    }

    /// Opens the replica without a server; changes stay pending.
    pub fn open_offline(&self) -> CliResult<Replica> {
        let dir = self.open_dir()?;
        let store = dir.open_store(StoreConfig::default())?;
        let service = GtdService::start(store, None)?;
        Ok(Replica { service, _dir: dir })
    }

    /// Opens the replica with sync enabled when a server is configured.
    pub fn open_online(&self) -> CliResult<Replica> {
        let dir = self.open_dir()?;
        let store = dir.open_store(StoreConfig::default())?;
        let sync = match self.settings.sync_config() {
            Some(config) => {
                let pin = self.settings.pinned_certificate(&config)?;
                let transport = ChannelTransport::new(&config, std::sync::Arc::new(pin));
                Some((config, transport))
            }
            None => None,
        };
        let service = GtdService::start(store, sync)?;
        Ok(Replica { service, _dir: dir })
    }
}

/// Parses an item number, with or without zero padding.
pub fn parse_item_num(text: &str) -> Result<u32, String> {
    let num: u32 = text
        .parse()
        .map_err(|_| format!("not an item number: {text}"))?;
    if num == 0 || num > MAX_NUM {
        return Err(format!("item number out of range 1..={MAX_NUM}: {text}"));
    }
    Ok(num)
}

/// Parses a `YYYY-MM-DD` date.
pub fn parse_day(text: &str) -> Result<Date, String> {
    parse_date(text).ok_or_else(|| format!("expected YYYY-MM-DD, got {text}"))
}

/// Parses a `name:password` account.
pub fn parse_account(text: &str) -> Result<(String, String), String> {
    match text.split_once(':') {
        Some((name, password)) if !name.is_empty() => {
            Ok((name.to_string(), password.to_string()))
        }
        _ => Err(format!("expected name:password, got {text}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_numbers() {
        assert_eq!(parse_item_num("42"), Ok(42));
        assert_eq!(parse_item_num("00000042"), Ok(42));
        assert!(parse_item_num("0").is_err());
        assert!(parse_item_num("100000000").is_err());
        assert!(parse_item_num("-1").is_err());
        assert!(parse_item_num("x").is_err());
    }

    #[test]
    fn days() {
        assert!(parse_day("2099-01-01").is_ok());
        assert!(parse_day("2099-1-1").is_err());
    }

    #[test]
    fn accounts() {
        assert_eq!(
            parse_account("ana:pa:ss"),
            Ok(("ana".to_string(), "pa:ss".to_string()))
        );
        assert!(parse_account(":pw").is_err());
        assert!(parse_account("ana").is_err());
    }

    #[test]
    fn data_dir_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("gtd.json");
        std::fs::write(&settings, r#"{ "data_dir": "/from/settings" }"#).unwrap();

        let context = Context::new(Some(&settings), None).unwrap();
        assert_eq!(context.data_dir, PathBuf::from("/from/settings"));

        let context = Context::new(Some(&settings), Some("/from/flag".into())).unwrap();
        assert_eq!(context.data_dir, PathBuf::from("/from/flag"));

        let context = Context::new(None, None).unwrap();
        assert_eq!(context.data_dir, PathBuf::from(DEFAULT_DATA_DIR));
    }

    #[test]
    fn offline_replica_persists_changes() {
        let dir = tempfile::tempdir().unwrap();
        let context = Context::new(None, Some(dir.path().join("replica"))).unwrap();
        {
            let replica = context.open_offline().unwrap();
            replica.service.set_title(7, "water plants").unwrap();
        }
        let replica = context.open_offline().unwrap();
        assert_eq!(replica.service.item_title(7).as_deref(), Some("water plants"));
        assert_eq!(replica.service.store().pending_count(), 1);
    }
}
