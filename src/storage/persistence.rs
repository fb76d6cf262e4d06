//! Chain persistence
//!
//! The active chain is dumped as
//! `[i32 block_count][for each block: u32 length][block bytes]`, genesis
//! excluded. Loading replays every block through `connect_block`; a block
//! that fails to land on the active chain resets the whole ledger.

use crate::core::{
    BinaryBuffer, Block, ChainState, CodecError, Decodable, Encodable, LedgerState,
    ACTIVE_CHAIN_INDEX,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Decoding error: {0}")]
    Codec(#[from] CodecError),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub chain_file: String,
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".tinycoin"),
            chain_file: "chain.dat".to_string(),
            backup_enabled: true,
            max_backups: 3,
        }
    }
}

/// Chain file manager
pub struct Storage {
    config: StorageConfig,
}

impl Storage {
    /// Create a new storage manager, creating the data directory
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self { config })
    }

    pub fn with_defaults() -> Result<Self, StorageError> {
        Self::new(StorageConfig::default())
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn chain_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.chain_file)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.backup.{}", self.config.chain_file, index))
    }

    pub fn exists(&self) -> bool {
        self.chain_path().exists()
    }

    /// Encode every active block above genesis
    pub fn encode_chain(chain: &ChainState) -> Vec<u8> {
        let blocks = &chain.active_chain()[1..];
        let mut buf = BinaryBuffer::new();
        buf.write_fixed(blocks.len() as i32);
        for block in blocks {
            buf.write_bytes(&block.encode_to_vec());
        }
        buf.into_vec()
    }

    pub fn decode_chain(bytes: &[u8]) -> Result<Vec<Block>, StorageError> {
        let mut buf = BinaryBuffer::from_bytes(bytes);
        let count: i32 = buf.read_fixed()?;
        let count = usize::try_from(count)
            .map_err(|_| StorageError::InvalidData(format!("negative block count {}", count)))?;

        let mut blocks = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            let bytes = buf.read_bytes()?;
            blocks.push(Block::decode_from(&bytes)?);
        }
        Ok(blocks)
    }

    /// Write the ledger's active chain, replacing the previous file
    pub fn save_chain(&self, ledger: &LedgerState) -> Result<(), StorageError> {
        let bytes = {
            let guard = ledger.lock();
            Self::encode_chain(guard.chain())
        };

        let path = self.chain_path();
        if self.config.backup_enabled && path.exists() {
            self.rotate_backups()?;
            fs::copy(&path, self.backup_path(0))?;
        }

        // write to a temporary file first, then rename over the old one
        let temp_path = self.config.data_dir.join(format!("{}.tmp", self.config.chain_file));
        let mut writer = BufWriter::new(fs::File::create(&temp_path)?);
        writer.write_all(&bytes)?;
        writer.flush()?;
        drop(writer);
        fs::rename(&temp_path, &path)?;

        info!("Saved chain to {}", path.display());
        Ok(())
    }

    /// Stored blocks, empty if nothing was saved yet
    pub fn load_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let path = self.chain_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        Self::decode_chain(&fs::read(path)?)
    }

    /// Replay the stored chain into `ledger`
    ///
    /// On any failure the ledger is reset to genesis and the error returned.
    pub fn load_chain(&self, ledger: &LedgerState) -> Result<usize, StorageError> {
        let blocks = match self.load_blocks() {
            Ok(blocks) => blocks,
            Err(e) => {
                ledger.reset();
                return Err(e);
            }
        };

        let mut guard = ledger.lock();
        let count = blocks.len();
        for (i, block) in blocks.into_iter().enumerate() {
            let block_id = block.id();
            if guard.connect_block(block, false) != Some(ACTIVE_CHAIN_INDEX) {
                warn!("Stored block {} did not connect, resetting ledger", block_id);
                guard.reset();
                return Err(StorageError::InvalidData(format!(
                    "block {} at height {} failed to connect",
                    block_id,
                    i + 1
                )));
            }
        }

        info!("Loaded {} blocks from {}", count, self.chain_path().display());
        Ok(count)
    }

    /// Delete the saved chain
    pub fn delete(&self) -> Result<(), StorageError> {
        let path = self.chain_path();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn rotate_backups(&self) -> Result<(), StorageError> {
        if self.config.max_backups == 0 {
            return Ok(());
        }

        let oldest = self.backup_path(self.config.max_backups - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        for i in (0..self.config.max_backups - 1).rev() {
            let current = self.backup_path(i);
            if current.exists() {
                fs::rename(&current, self.backup_path(i + 1))?;
            }
        }

        Ok(())
    }

    /// List available backups
    pub fn list_backups(&self) -> Vec<usize> {
        (0..self.config.max_backups)
            .filter(|&i| self.backup_path(i).exists())
            .collect()
    }

    pub fn stats(&self) -> Result<StorageStats, StorageError> {
        let path = self.chain_path();
        let file_size = if path.exists() {
            fs::metadata(&path)?.len()
        } else {
            0
        };

        Ok(StorageStats {
            file_size,
            backup_count: self.list_backups().len(),
            data_dir: self.config.data_dir.clone(),
        })
    }
}

/// Storage statistics
#[derive(Debug, Serialize)]
pub struct StorageStats {
    pub file_size: u64,
    pub backup_count: usize,
    pub data_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ChainParams;
    use crate::test_utils::next_block;

    fn temp_storage(dir: &tempfile::TempDir) -> Storage {
        Storage::new(StorageConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_save_load_chain() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = temp_storage(&temp_dir);

        let ledger = LedgerState::new(ChainParams::regtest());
        for i in 1..=3 {
            ledger.connect_block(next_block(&ledger, "miner", i));
        }
        storage.save_chain(&ledger).unwrap();
        assert!(storage.exists());

        let bytes = fs::read(storage.chain_path()).unwrap();
        assert_eq!(i32::from_le_bytes(bytes[..4].try_into().unwrap()), 3);

        let restored = LedgerState::new(ChainParams::regtest());
        assert_eq!(storage.load_chain(&restored).unwrap(), 3);
        assert_eq!(restored.tip_id(), ledger.tip_id());
        assert_eq!(restored.balance("miner"), ledger.balance("miner"));
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = temp_storage(&temp_dir);
        let ledger = LedgerState::new(ChainParams::regtest());
        assert_eq!(storage.load_chain(&ledger).unwrap(), 0);
        assert_eq!(ledger.height(), 1);
    }

    #[test]
    fn test_bad_block_resets_ledger() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = temp_storage(&temp_dir);

        let source = LedgerState::new(ChainParams::regtest());
        for i in 1..=2 {
            source.connect_block(next_block(&source, "miner", i));
        }
        let mut blocks = source.active_chain().split_off(1);
        // drop the first block so the second no longer has a parent
        blocks.remove(0);

        let mut buf = BinaryBuffer::new();
        buf.write_fixed(blocks.len() as i32);
        for block in &blocks {
            buf.write_bytes(&block.encode_to_vec());
        }
        fs::write(storage.chain_path(), buf.into_vec()).unwrap();

        let ledger = LedgerState::new(ChainParams::regtest());
        assert!(storage.load_chain(&ledger).is_err());
        assert_eq!(ledger.height(), 1);
        assert!(ledger.lock().chain().orphan_blocks().is_empty());
    }

    #[test]
    fn test_truncated_file_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = temp_storage(&temp_dir);
        fs::write(storage.chain_path(), [1, 0, 0, 0, 200]).unwrap();

        let ledger = LedgerState::new(ChainParams::regtest());
        assert!(matches!(storage.load_chain(&ledger), Err(StorageError::Codec(_))));
        assert_eq!(ledger.height(), 1);
    }

    #[test]
    fn test_backup_rotation() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(StorageConfig {
            data_dir: temp_dir.path().to_path_buf(),
            max_backups: 2,
            ..Default::default()
        })
        .unwrap();

        let ledger = LedgerState::new(ChainParams::regtest());
        for i in 1..=4 {
            storage.save_chain(&ledger).unwrap();
            ledger.connect_block(next_block(&ledger, "miner", i));
        }

        assert_eq!(storage.list_backups(), vec![0, 1]);
        assert_eq!(storage.stats().unwrap().backup_count, 2);
    }
}
