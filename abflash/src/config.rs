// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs, io, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    device::StorageKind,
    format::gpt,
    partition::PartitionAttributes,
};

/// Upper bound for the number of UFS LUNs that are probed.
pub const MAX_LUNS: u8 = 8;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config: {0}")]
    Read(String, #[source] io::Error),
    #[error("Failed to parse config")]
    Parse(#[from] toml_edit::de::Error),
    #[error("Retry count must be at most {max}: {0}", max = PartitionAttributes::MAX_RETRY_COUNT)]
    InvalidRetryCount(u8),
    #[error("LUN count must be between 1 and {max}: {0}", max = MAX_LUNS)]
    InvalidMaxLuns(u8),
    #[error("Partition limit must be non-zero")]
    InvalidMaxPartitions,
    #[error("Partition entry array size must be a non-zero multiple of {size}: {0}", size = gpt::ENTRY_SIZE)]
    InvalidMaxArraySize(u32),
}

type Result<T> = std::result::Result<T, Error>;

/// Platform constants for the partition and slot engine.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageKind,
    /// Number of LUNs to probe on UFS. eMMC always has exactly one.
    pub max_luns: u8,
    /// Maximum number of partition entries across all LUNs.
    pub max_partitions: usize,
    /// Maximum size of a GPT partition entry array in bytes.
    pub max_partition_array_size: u32,
    /// Retry count given to a slot when it is activated or its boot image is
    /// reflashed.
    pub retry_count: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageKind::Ufs,
            max_luns: MAX_LUNS,
            max_partitions: 128 * usize::from(MAX_LUNS),
            max_partition_array_size: gpt::DEFAULT_MAX_ARRAY_SIZE,
            retry_count: PartitionAttributes::MAX_RETRY_COUNT,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| Error::Read(path.display().to_string(), e))?;

        Self::from_toml(&data)
    }

    pub fn from_toml(data: &str) -> Result<Self> {
        let config: Self = toml_edit::de::from_str(data)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry_count > PartitionAttributes::MAX_RETRY_COUNT {
            return Err(Error::InvalidRetryCount(self.retry_count));
        } else if self.max_luns == 0 || self.max_luns > MAX_LUNS {
            return Err(Error::InvalidMaxLuns(self.max_luns));
        } else if self.max_partitions == 0 {
            return Err(Error::InvalidMaxPartitions);
        } else if self.max_partition_array_size == 0
            || self.max_partition_array_size % gpt::ENTRY_SIZE != 0
        {
            return Err(Error::InvalidMaxArraySize(self.max_partition_array_size));
        }

        Ok(())
    }

    /// Number of LUNs that should be probed for this storage type.
    pub fn lun_limit(&self) -> u8 {
        match self.storage {
            StorageKind::Emmc => 1,
            StorageKind::Ufs => self.max_luns,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"storage = \"ufs\"\nmax_luns = 4\nretry_count = 3\n")
            .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.storage, StorageKind::Ufs);
        assert_eq!(config.lun_limit(), 4);
        assert_eq!(config.retry_count, 3);

        let missing = file.path().with_extension("missing");
        assert_matches!(Config::load(&missing), Err(Error::Read(_, _)));
    }

    #[test]
    fn defaults_for_missing_fields() {
        let config = Config::from_toml("storage = \"emmc\"\n").unwrap();

        assert_eq!(config.storage, StorageKind::Emmc);
        assert_eq!(config.max_luns, 8);
        assert_eq!(config.max_partitions, 1024);
        assert_eq!(config.max_partition_array_size, 16384);
        assert_eq!(config.retry_count, 7);
        assert_eq!(config.lun_limit(), 1);

        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn reject_invalid_values() {
        assert_matches!(
            Config::from_toml("retry_count = 8"),
            Err(Error::InvalidRetryCount(8))
        );
        assert_matches!(
            Config::from_toml("max_luns = 0"),
            Err(Error::InvalidMaxLuns(0))
        );
        assert_matches!(
            Config::from_toml("max_luns = 9"),
            Err(Error::InvalidMaxLuns(9))
        );
        assert_matches!(
            Config::from_toml("max_partition_array_size = 100"),
            Err(Error::InvalidMaxArraySize(100))
        );
        assert_matches!(
            Config::from_toml("storage = \"nvme\""),
            Err(Error::Parse(_))
        );
    }
}
