//! Map/set construction configuration.

use crate::error::{MapError, Result};

/// Replication is opt-in; a map with no `ReplicationConfig` never stamps
/// entries with origin metadata and rejects `remote_apply` calls.
#[derive(Debug, Clone, Copy)]
pub struct ReplicationConfig {
    pub node_id: u8,
}

#[derive(Debug, Clone)]
pub struct MapConfig {
    pub segments: u32,
    pub tier_slots: u32,
    pub max_entry_bytes: u32,
    pub pool_tier_count: u32,
    pub replication: Option<ReplicationConfig>,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            segments: 16,
            tier_slots: 64,
            max_entry_bytes: 256,
            pool_tier_count: 64,
            replication: None,
        }
    }
}

impl MapConfig {
    pub fn builder() -> MapConfigBuilder {
        MapConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if !self.segments.is_power_of_two() || self.segments == 0 {
            return Err(MapError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "segments must be a non-zero power of two",
            )));
        }
        if !self.tier_slots.is_power_of_two() || self.tier_slots == 0 {
            return Err(MapError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tier_slots must be a non-zero power of two",
            )));
        }
        if self.max_entry_bytes == 0 {
            return Err(MapError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "max_entry_bytes must be non-zero",
            )));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MapConfigBuilder {
    inner: MapConfig,
}

impl MapConfigBuilder {
    pub fn segments(mut self, n: u32) -> Self {
        self.inner.segments = n;
        self
    }

    pub fn tier_slots(mut self, n: u32) -> Self {
        self.inner.tier_slots = n;
        self
    }

    pub fn max_entry_bytes(mut self, n: u32) -> Self {
        self.inner.max_entry_bytes = n;
        self
    }

    pub fn pool_tier_count(mut self, n: u32) -> Self {
        self.inner.pool_tier_count = n;
        self
    }

    pub fn replication(mut self, node_id: u8) -> Self {
        self.inner.replication = Some(ReplicationConfig { node_id });
        self
    }

    pub fn build(self) -> Result<MapConfig> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(MapConfig::default().validate().is_ok());
    }

    #[test]
    fn non_power_of_two_segments_rejected() {
        let cfg = MapConfig::builder().segments(3).build();
        assert!(cfg.is_err());
    }

    #[test]
    fn builder_sets_replication() {
        let cfg = MapConfig::builder().replication(5).build().unwrap();
        assert_eq!(cfg.replication.unwrap().node_id, 5);
    }
}
