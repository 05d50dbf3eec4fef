use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A storage-pool-qualified volume, rendered as `<pool>:<volume>`.
///
/// Disk references are produced by the hypervisor when a disk is imported;
/// fabriclab only ever recovers them from command output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiskReference {
    pub pool: String,
    pub volume: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiskReferenceParseError {
    #[error("Disk reference '{0}' is missing the ':' between pool and volume")]
    MissingSeparator(String),
    #[error("Disk reference '{0}' has an empty pool or volume")]
    EmptyComponent(String),
}

impl DiskReference {
    pub fn new(pool: impl Into<String>, volume: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            volume: volume.into(),
        }
    }
}

impl fmt::Display for DiskReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pool, self.volume)
    }
}

impl FromStr for DiskReference {
    type Err = DiskReferenceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (pool, volume) = s
            .split_once(':')
            .ok_or_else(|| DiskReferenceParseError::MissingSeparator(s.to_string()))?;
        let (pool, volume) = (pool.trim(), volume.trim());
        if pool.is_empty() || volume.is_empty() {
            return Err(DiskReferenceParseError::EmptyComponent(s.to_string()));
        }

        Ok(Self::new(pool, volume))
    }
}

impl Serialize for DiskReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DiskReference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
