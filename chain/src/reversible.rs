// Store of blocks that were applied locally but are not irreversible
// yet. Rows are written on commit, dropped either on pop or once the
// block falls at or below the last irreversible block.

use std::path::Path;

use log::trace;
use sigil_common::{block::SignedBlock, serializer::Serializer};

use crate::error::ChainError;

pub struct ReversibleBlockStore {
    db: sled::Db,
    blocks: sled::Tree,
}

impl ReversibleBlockStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ChainError> {
        let db = sled::open(path)?;
        let blocks = db.open_tree("blocks")?;
        Ok(Self { db, blocks })
    }

    pub fn insert(&mut self, block: &SignedBlock) -> Result<(), ChainError> {
        trace!("storing reversible block {}", block.block_num());
        self.blocks
            .insert(block.block_num().to_be_bytes(), block.to_bytes())?;
        Ok(())
    }

    pub fn remove(&mut self, block_num: u32) -> Result<(), ChainError> {
        self.blocks.remove(block_num.to_be_bytes())?;
        Ok(())
    }

    // Drop every row with a number at or below the given one
    pub fn prune_to(&mut self, block_num: u32) -> Result<(), ChainError> {
        while let Some((key, _)) = self.blocks.first()? {
            let num = Self::num_from_key(&key)?;
            if num > block_num {
                break;
            }
            self.blocks.remove(key)?;
        }
        Ok(())
    }

    pub fn get(&self, block_num: u32) -> Result<Option<SignedBlock>, ChainError> {
        match self.blocks.get(block_num.to_be_bytes())? {
            Some(bytes) => Ok(Some(SignedBlock::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn first_block_num(&self) -> Result<Option<u32>, ChainError> {
        match self.blocks.first()? {
            Some((key, _)) => Ok(Some(Self::num_from_key(&key)?)),
            None => Ok(None),
        }
    }

    pub fn last_block_num(&self) -> Result<Option<u32>, ChainError> {
        match self.blocks.last()? {
            Some((key, _)) => Ok(Some(Self::num_from_key(&key)?)),
            None => Ok(None),
        }
    }

    pub fn flush(&self) -> Result<(), ChainError> {
        self.db.flush()?;
        Ok(())
    }

    fn num_from_key(key: &[u8]) -> Result<u32, ChainError> {
        let bytes: [u8; 4] = key
            .try_into()
            .map_err(|_| ChainError::StorageInconsistent("bad reversible block key".into()))?;
        Ok(u32::from_be_bytes(bytes))
    }
}
