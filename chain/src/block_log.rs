// Append-only log of irreversible blocks. The log file holds
// length-prefixed serialized signed blocks; the index file holds one
// 8-byte little-endian offset per block, pointing at its length prefix.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::{debug, info, warn};
use sigil_common::{block::SignedBlock, serializer::Serializer};

use crate::error::ChainError;

const LOG_FILE: &str = "blocks.log";
const INDEX_FILE: &str = "blocks.index";

pub struct BlockLog {
    log_path: PathBuf,
    index_path: PathBuf,
    // Offset of each block's length prefix, in block order
    offsets: Vec<u64>,
    first_block_num: u32,
    head: Option<SignedBlock>,
}

impl BlockLog {
    pub fn open<P: AsRef<Path>>(blocks_dir: P) -> Result<Self, ChainError> {
        std::fs::create_dir_all(&blocks_dir)?;
        let log_path = blocks_dir.as_ref().join(LOG_FILE);
        let index_path = blocks_dir.as_ref().join(INDEX_FILE);

        let mut log = Self {
            log_path,
            index_path,
            offsets: Vec::new(),
            first_block_num: 0,
            head: None,
        };
        log.load()?;
        Ok(log)
    }

    pub fn head(&self) -> Option<&SignedBlock> {
        self.head.as_ref()
    }

    pub fn head_block_num(&self) -> Option<u32> {
        self.head.as_ref().map(SignedBlock::block_num)
    }

    pub fn first_block_num(&self) -> u32 {
        self.first_block_num
    }

    pub fn append(&mut self, block: &SignedBlock) -> Result<(), ChainError> {
        if let Some(head) = &self.head {
            let expected = head.block_num() + 1;
            if block.block_num() != expected {
                return Err(ChainError::BlockLogOutOfOrder {
                    appending: block.block_num(),
                    head: head.block_num(),
                });
            }
        }

        let bytes = block.to_bytes();
        let mut log = OpenOptions::new().create(true).append(true).open(&self.log_path)?;
        let offset = log.seek(SeekFrom::End(0))?;
        log.write_all(&(bytes.len() as u32).to_le_bytes())?;
        log.write_all(&bytes)?;
        log.sync_data()?;

        let mut index = OpenOptions::new().create(true).append(true).open(&self.index_path)?;
        index.write_all(&offset.to_le_bytes())?;
        index.sync_data()?;

        debug!("appended block {} to block log", block.block_num());
        if self.offsets.is_empty() {
            self.first_block_num = block.block_num();
        }
        self.offsets.push(offset);
        self.head = Some(block.clone());
        Ok(())
    }

    pub fn read_head(&self) -> Option<&SignedBlock> {
        self.head.as_ref()
    }

    pub fn read_block_by_num(&self, block_num: u32) -> Result<Option<SignedBlock>, ChainError> {
        let Some(head) = &self.head else {
            return Ok(None);
        };
        if block_num < self.first_block_num || block_num > head.block_num() {
            return Ok(None);
        }
        let position = (block_num - self.first_block_num) as usize;
        let mut file = File::open(&self.log_path)?;
        Ok(Some(Self::read_record(&mut file, self.offsets[position])?))
    }

    // Throw away any existing log and start over from the given genesis block
    pub fn reset_to_genesis(&mut self, genesis_block: &SignedBlock) -> Result<(), ChainError> {
        info!("resetting block log to genesis");
        let _ = std::fs::remove_file(&self.log_path);
        let _ = std::fs::remove_file(&self.index_path);
        self.offsets.clear();
        self.head = None;
        self.first_block_num = 0;
        self.append(genesis_block)
    }

    fn load(&mut self) -> Result<(), ChainError> {
        if !self.log_path.exists() {
            return Ok(());
        }

        let mut index_bytes = Vec::new();
        if self.index_path.exists() {
            File::open(&self.index_path)?.read_to_end(&mut index_bytes)?;
        }
        if index_bytes.len() % 8 != 0 {
            warn!("block log index has a partial entry, truncating");
            index_bytes.truncate(index_bytes.len() - index_bytes.len() % 8);
        }

        let mut offsets: Vec<u64> = index_bytes
            .chunks_exact(8)
            .map(|chunk| u64::from_le_bytes(chunk.try_into().expect("chunk is 8 bytes")))
            .collect();

        // Keep the longest prefix of records that read back cleanly
        let mut file = File::open(&self.log_path)?;
        let log_len = file.metadata()?.len();
        let mut good = 0;
        let mut good_end = 0u64;
        for offset in &offsets {
            match Self::try_read_record(&mut file, *offset, log_len) {
                Some(end) => {
                    good += 1;
                    good_end = end;
                }
                None => break,
            }
        }

        if good < offsets.len() || good_end < log_len {
            warn!(
                "block log tail is corrupted, truncating to {} complete blocks",
                good
            );
            offsets.truncate(good);
            OpenOptions::new().write(true).open(&self.log_path)?.set_len(good_end)?;
            let mut index = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&self.index_path)?;
            index.set_len(0)?;
            for offset in &offsets {
                index.write_all(&offset.to_le_bytes())?;
            }
            index.sync_data()?;
        }

        if let Some(first) = offsets.first() {
            let block = Self::read_record(&mut file, *first)?;
            self.first_block_num = block.block_num();
        }
        if let Some(last) = offsets.last() {
            self.head = Some(Self::read_record(&mut file, *last)?);
        }
        self.offsets = offsets;

        if let Some(head) = &self.head {
            debug!(
                "block log spans blocks {} to {}",
                self.first_block_num,
                head.block_num()
            );
        }
        Ok(())
    }

    fn read_record(file: &mut File, offset: u64) -> Result<SignedBlock, ChainError> {
        file.seek(SeekFrom::Start(offset))?;
        let mut length_bytes = [0u8; 4];
        file.read_exact(&mut length_bytes)?;
        let length = u32::from_le_bytes(length_bytes) as usize;
        let mut bytes = vec![0u8; length];
        file.read_exact(&mut bytes)?;
        SignedBlock::from_bytes(&bytes)
            .map_err(|e| ChainError::BlockLogCorrupted(e.to_string()))
    }

    // Returns the end offset of the record when it parses, None otherwise
    fn try_read_record(file: &mut File, offset: u64, log_len: u64) -> Option<u64> {
        if offset + 4 > log_len {
            return None;
        }
        if file.seek(SeekFrom::Start(offset)).is_err() {
            return None;
        }
        let mut length_bytes = [0u8; 4];
        file.read_exact(&mut length_bytes).ok()?;
        let length = u32::from_le_bytes(length_bytes) as u64;
        let end = offset + 4 + length;
        if end > log_len {
            return None;
        }
        let mut bytes = vec![0u8; length as usize];
        file.read_exact(&mut bytes).ok()?;
        SignedBlock::from_bytes(&bytes).ok()?;
        Some(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigil_common::{
        block::{BlockHeader, SignedBlockHeader},
        crypto::{hash, KeyPair},
    };

    use tempdir::TempDir;

    fn make_block(previous: sigil_common::crypto::Hash) -> SignedBlock {
        let pair = KeyPair::random();
        let mut header = BlockHeader::default();
        header.previous = previous;
        let signature = pair.sign(&header.digest());
        SignedBlock::new(SignedBlockHeader {
            header,
            producer_signature: signature,
        })
    }

    fn make_chain(length: usize) -> Vec<SignedBlock> {
        let mut blocks = Vec::new();
        let mut previous = sigil_common::crypto::Hash::zero();
        for _ in 0..length {
            let block = make_block(previous);
            previous = block.id();
            blocks.push(block);
        }
        blocks
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new("block-log").unwrap();
        let mut log = BlockLog::open(dir.path()).unwrap();
        assert!(log.head().is_none());

        let blocks = make_chain(3);
        for block in &blocks {
            log.append(block).unwrap();
        }

        assert_eq!(log.head_block_num(), Some(3));
        assert_eq!(log.read_block_by_num(2).unwrap().unwrap(), blocks[1]);
        assert!(log.read_block_by_num(0).unwrap().is_none());
        assert!(log.read_block_by_num(4).unwrap().is_none());
    }

    #[test]
    fn test_append_rejects_gaps() {
        let dir = TempDir::new("block-log").unwrap();
        let mut log = BlockLog::open(dir.path()).unwrap();

        let blocks = make_chain(3);
        log.append(&blocks[0]).unwrap();
        assert!(matches!(
            log.append(&blocks[2]),
            Err(ChainError::BlockLogOutOfOrder { appending: 3, head: 1 })
        ));
    }

    #[test]
    fn test_reopen_preserves_state() {
        let dir = TempDir::new("block-log").unwrap();
        let blocks = make_chain(2);
        {
            let mut log = BlockLog::open(dir.path()).unwrap();
            for block in &blocks {
                log.append(block).unwrap();
            }
        }

        let log = BlockLog::open(dir.path()).unwrap();
        assert_eq!(log.head_block_num(), Some(2));
        assert_eq!(log.read_block_by_num(1).unwrap().unwrap(), blocks[0]);
    }

    #[test]
    fn test_corrupted_tail_is_truncated() {
        let dir = TempDir::new("block-log").unwrap();
        let blocks = make_chain(2);
        {
            let mut log = BlockLog::open(dir.path()).unwrap();
            for block in &blocks {
                log.append(block).unwrap();
            }
        }

        // Chop bytes off the end of the last record
        let log_path = dir.path().join(LOG_FILE);
        let len = std::fs::metadata(&log_path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&log_path)
            .unwrap()
            .set_len(len - 10)
            .unwrap();

        let log = BlockLog::open(dir.path()).unwrap();
        assert_eq!(log.head_block_num(), Some(1));
        assert_eq!(log.read_block_by_num(1).unwrap().unwrap(), blocks[0]);
        assert!(log.read_block_by_num(2).unwrap().is_none());
    }

    #[test]
    fn test_reset_to_genesis() {
        let dir = TempDir::new("block-log").unwrap();
        let mut log = BlockLog::open(dir.path()).unwrap();
        for block in &make_chain(3) {
            log.append(block).unwrap();
        }

        let genesis = make_block(hash(b"fresh"));
        // A fresh genesis replaces the whole log
        log.reset_to_genesis(&genesis).unwrap();
        assert_eq!(log.head().unwrap(), &genesis);
        assert_eq!(log.first_block_num(), genesis.block_num());
    }
}
