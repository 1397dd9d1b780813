//! Command store configuration.

/// Configuration for opening a [`CommandStore`](crate::CommandStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to fsync after every appended batch.
    ///
    /// Acknowledgement and cursor records are always synced.
    pub sync_on_write: bool,

    /// Origin id to use when creating a new log.
    ///
    /// Ignored for an existing log, which keeps the id it was created with.
    /// `None` draws a random non-zero id.
    pub origin_id: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            origin_id: None,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether every batch is fsynced.
    #[must_use]
    pub const fn with_sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Fixes the origin id for a new log. Zero is treated as unset.
    #[must_use]
    pub const fn with_origin_id(mut self, origin_id: u64) -> Self {
        self.origin_id = if origin_id == 0 { None } else { Some(origin_id) };
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_durable() {
        let config = StoreConfig::new();
        assert!(config.sync_on_write);
        assert_eq!(config.origin_id, None);
    }

    #[test]
    fn zero_origin_is_unset() {
        assert_eq!(StoreConfig::new().with_origin_id(0).origin_id, None);
        assert_eq!(StoreConfig::new().with_origin_id(3).origin_id, Some(3));
    }
}
