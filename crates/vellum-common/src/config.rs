//! Configuration structures for Vellum.

use serde::{Deserialize, Serialize};

/// Storage configuration for an index instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Buffer pool size in number of frames.
    pub buffer_pool_frames: usize,
    /// K parameter of the LRU-K replacement policy.
    pub replacer_k: usize,
    /// Enable fsync for durability.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            buffer_pool_frames: 1024, // 4 MB with 4 KB pages
            replacer_k: 2,
            fsync_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.buffer_pool_frames, 1024);
        assert_eq!(config.replacer_k, 2);
        assert!(config.fsync_enabled);
    }

    #[test]
    fn test_storage_config_custom() {
        let config = StorageConfig {
            buffer_pool_frames: 16,
            replacer_k: 3,
            fsync_enabled: false,
        };

        assert_eq!(config.buffer_pool_frames, 16);
        assert_eq!(config.replacer_k, 3);
        assert!(!config.fsync_enabled);
    }

    #[test]
    fn test_storage_config_clone() {
        let config1 = StorageConfig::default();
        let config2 = config1.clone();
        assert_eq!(config1.buffer_pool_frames, config2.buffer_pool_frames);
        assert_eq!(config1.replacer_k, config2.replacer_k);
    }

    #[test]
    fn test_storage_config_serde_roundtrip() {
        let original = StorageConfig::default();
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: StorageConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.buffer_pool_frames, deserialized.buffer_pool_frames);
        assert_eq!(original.replacer_k, deserialized.replacer_k);
        assert_eq!(original.fsync_enabled, deserialized.fsync_enabled);
    }
}
