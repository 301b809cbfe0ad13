//! File-based block store.

use std::fs;
use std::path::{Path, PathBuf};

use ledger_core::Block;
use thiserror::Error;

/// Errors surfaced by the block store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted store: {0}")]
    Corrupted(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Stores each accepted block as `block_{index:010}.bin` in bincode format.
///
/// Writes go to a temp file first and are renamed into place, so a crash
/// never leaves a half-written block behind.
#[derive(Debug, Clone)]
pub struct FileBlockStore {
    base_dir: PathBuf,
}

impl FileBlockStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn block_path(&self, index: u64) -> PathBuf {
        self.base_dir.join(format!("block_{:010}.bin", index))
    }

    pub fn save(&self, block: &Block) -> Result<()> {
        let path = self.block_path(block.index);
        let temp_path = path.with_extension("bin.tmp");

        let bytes =
            bincode::serialize(block).map_err(|e| StoreError::Serialization(e.to_string()))?;
        fs::write(&temp_path, bytes)?;
        fs::rename(&temp_path, &path)?;

        tracing::trace!("Saved block[{}] to {}", block.index, path.display());
        Ok(())
    }

    /// Every stored block in index order.
    ///
    /// Indices must run from 0 without gaps and every file must decode to
    /// the block its name claims.
    pub fn load_all(&self) -> Result<Vec<Block>> {
        let mut indices = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if let Some(filename) = path.file_name().and_then(|s| s.to_str())
                && let Some(index_str) = filename
                    .strip_prefix("block_")
                    .and_then(|s| s.strip_suffix(".bin"))
                && let Ok(index) = index_str.parse::<u64>()
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();

        let mut blocks = Vec::with_capacity(indices.len());
        for (expected, index) in indices.into_iter().enumerate() {
            if index != expected as u64 {
                return Err(StoreError::Corrupted(format!(
                    "missing block {} (found {})",
                    expected, index
                )));
            }

            let bytes = fs::read(self.block_path(index))?;
            let block: Block = bincode::deserialize(&bytes).map_err(|e| {
                StoreError::Corrupted(format!("block {} does not decode: {}", index, e))
            })?;
            if block.index != index {
                return Err(StoreError::Corrupted(format!(
                    "file for block {} holds block {}",
                    index, block.index
                )));
            }
            blocks.push(block);
        }

        tracing::debug!("Loaded {} block(s) from {}", blocks.len(), self.base_dir.display());
        Ok(blocks)
    }
}
