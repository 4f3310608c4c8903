// Typed indices of the chain-state store: global properties, the TaPoS
// block-summary ring, and the transaction deduplication window.

use std::path::Path;

use log::trace;
use serde::{Deserialize, Serialize};
use sigil_common::{
    config::ChainConfig,
    crypto::Hash,
    name::Name128,
    producer::ProducerSchedule,
    serializer::{Reader, ReaderError, Serializer, Writer},
    time::TimePointSec,
};

use crate::{error::ChainError, store::UndoStore};

const TREE_GLOBAL: usize = 0;
const TREE_SUMMARY: usize = 1;
const TREE_DEDUP: usize = 2;
const TREE_DEDUP_EXP: usize = 3;
const TREE_RECV_SEQ: usize = 4;

const KEY_GLOBAL: &[u8] = b"global";
const KEY_DYNAMIC: &[u8] = b"dynamic";

// Chain configuration plus the producer schedule proposal slot
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GlobalProperty {
    pub configuration: ChainConfig,
    pub proposed_schedule_block_num: Option<u32>,
    pub proposed_schedule: ProducerSchedule,
}

impl Serializer for GlobalProperty {
    fn write(&self, writer: &mut Writer) {
        self.configuration.write(writer);
        self.proposed_schedule_block_num.write(writer);
        self.proposed_schedule.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            configuration: ChainConfig::read(reader)?,
            proposed_schedule_block_num: Option::read(reader)?,
            proposed_schedule: ProducerSchedule::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.configuration.size()
            + self.proposed_schedule_block_num.size()
            + self.proposed_schedule.size()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct DynamicGlobalProperty {
    // Monotonic counter feeding every action receipt
    pub global_action_sequence: u64,
}

impl Serializer for DynamicGlobalProperty {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.global_action_sequence);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            global_action_sequence: reader.read_u64()?,
        })
    }

    fn size(&self) -> usize {
        8
    }
}

pub struct ChainStore {
    store: UndoStore,
}

impl ChainStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ChainError> {
        let store = UndoStore::open(path, &["global", "summary", "dedup", "dedup_exp", "recv_seq"])?;
        Ok(Self { store })
    }

    pub fn revision(&self) -> u64 {
        self.store.revision()
    }

    pub fn set_revision(&mut self, revision: u64) -> Result<(), ChainError> {
        self.store.set_revision(revision)
    }

    pub fn start_undo_session(&mut self, enabled: bool) -> u64 {
        self.store.start_undo_session(enabled)
    }

    pub fn squash(&mut self) -> Result<(), ChainError> {
        self.store.squash()
    }

    pub fn undo(&mut self) -> Result<(), ChainError> {
        self.store.undo()
    }

    pub fn undo_all(&mut self) -> Result<(), ChainError> {
        self.store.undo_all()
    }

    pub fn commit(&mut self, revision: u64) -> Result<(), ChainError> {
        self.store.commit(revision)
    }

    pub fn flush(&self) -> Result<(), ChainError> {
        self.store.flush()
    }

    pub fn get_global_property(&self) -> Result<GlobalProperty, ChainError> {
        let bytes = self.store.get(TREE_GLOBAL, KEY_GLOBAL)?.ok_or_else(|| {
            ChainError::StorageInconsistent("global property row is missing".into())
        })?;
        Ok(GlobalProperty::from_bytes(&bytes)?)
    }

    pub fn set_global_property(&mut self, property: &GlobalProperty) -> Result<(), ChainError> {
        self.store.insert(TREE_GLOBAL, KEY_GLOBAL, &property.to_bytes())
    }

    pub fn has_global_property(&self) -> Result<bool, ChainError> {
        self.store.contains(TREE_GLOBAL, KEY_GLOBAL)
    }

    pub fn get_dynamic_global_property(&self) -> Result<DynamicGlobalProperty, ChainError> {
        let bytes = self.store.get(TREE_GLOBAL, KEY_DYNAMIC)?.ok_or_else(|| {
            ChainError::StorageInconsistent("dynamic global property row is missing".into())
        })?;
        Ok(DynamicGlobalProperty::from_bytes(&bytes)?)
    }

    pub fn set_dynamic_global_property(
        &mut self,
        property: &DynamicGlobalProperty,
    ) -> Result<(), ChainError> {
        self.store.insert(TREE_GLOBAL, KEY_DYNAMIC, &property.to_bytes())
    }

    // TaPoS ring: a missing slot reads as the zero id
    pub fn get_block_summary(&self, slot: u16) -> Result<Hash, ChainError> {
        match self.store.get(TREE_SUMMARY, &slot.to_be_bytes())? {
            Some(bytes) => Ok(Hash::from_bytes(&bytes)?),
            None => Ok(Hash::zero()),
        }
    }

    pub fn set_block_summary(&mut self, slot: u16, id: &Hash) -> Result<(), ChainError> {
        self.store.insert(TREE_SUMMARY, &slot.to_be_bytes(), id.as_bytes())
    }

    // Record a transaction in the dedup window; the same id may not be
    // inserted twice before its expiration evicts it
    pub fn insert_transaction(
        &mut self,
        id: &Hash,
        expiration: TimePointSec,
    ) -> Result<(), ChainError> {
        if self.store.contains(TREE_DEDUP, id.as_bytes())? {
            return Err(ChainError::TxDuplicate(id.clone()));
        }
        self.store
            .insert(TREE_DEDUP, id.as_bytes(), &expiration.to_bytes())?;
        self.store
            .insert(TREE_DEDUP_EXP, &Self::expiration_key(expiration, id), &[])?;
        Ok(())
    }

    pub fn contains_transaction(&self, id: &Hash) -> Result<bool, ChainError> {
        self.store.contains(TREE_DEDUP, id.as_bytes())
    }

    // Drop every dedup record that expired strictly before `now`
    pub fn evict_expired_transactions(&mut self, now: TimePointSec) -> Result<(), ChainError> {
        loop {
            let Some(entry) = self.store.tree(TREE_DEDUP_EXP).first()? else {
                return Ok(());
            };
            let (key, _) = entry;
            if key.len() != 4 + 32 {
                return Err(ChainError::StorageInconsistent(
                    "bad dedup expiration key".into(),
                ));
            }
            let expiration =
                TimePointSec::new(u32::from_be_bytes(key[0..4].try_into().expect("length checked")));
            if now <= expiration {
                return Ok(());
            }
            trace!("evicting expired transaction record at {}", expiration);
            self.store.remove(TREE_DEDUP, &key[4..])?;
            self.store.remove(TREE_DEDUP_EXP, &key)?;
        }
    }

    // Next per-recipient sequence number for an action receipt
    pub fn next_recv_sequence(&mut self, domain: &Name128) -> Result<u64, ChainError> {
        let key = domain.as_u128().to_le_bytes();
        let next = match self.store.get(TREE_RECV_SEQ, &key)? {
            Some(bytes) => {
                u64::from_le_bytes(bytes.as_ref().try_into().map_err(|_| {
                    ChainError::StorageInconsistent("bad recv sequence row".into())
                })?) + 1
            }
            None => 1,
        };
        self.store.insert(TREE_RECV_SEQ, &key, &next.to_le_bytes())?;
        Ok(next)
    }

    fn expiration_key(expiration: TimePointSec, id: &Hash) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[0..4].copy_from_slice(&expiration.as_secs().to_be_bytes());
        key[4..].copy_from_slice(id.as_bytes());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigil_common::crypto::hash;
    use tempdir::TempDir;

    #[test]
    fn test_dedup_window() {
        let dir = TempDir::new("chain-store").unwrap();
        let mut store = ChainStore::open(dir.path().join("state")).unwrap();

        let id = hash(b"trx");
        store.insert_transaction(&id, TimePointSec::new(100)).unwrap();
        assert!(matches!(
            store.insert_transaction(&id, TimePointSec::new(100)),
            Err(ChainError::TxDuplicate(_))
        ));

        // Not yet expired at its own expiration second
        store.evict_expired_transactions(TimePointSec::new(100)).unwrap();
        assert!(store.contains_transaction(&id).unwrap());

        store.evict_expired_transactions(TimePointSec::new(101)).unwrap();
        assert!(!store.contains_transaction(&id).unwrap());
        store.insert_transaction(&id, TimePointSec::new(200)).unwrap();
    }

    #[test]
    fn test_dedup_rolls_back_with_session() {
        let dir = TempDir::new("chain-store").unwrap();
        let mut store = ChainStore::open(dir.path().join("state")).unwrap();

        let id = hash(b"trx");
        store.start_undo_session(true);
        store.insert_transaction(&id, TimePointSec::new(100)).unwrap();
        store.undo().unwrap();
        assert!(!store.contains_transaction(&id).unwrap());
    }

    #[test]
    fn test_block_summary_defaults_to_zero() {
        let dir = TempDir::new("chain-store").unwrap();
        let mut store = ChainStore::open(dir.path().join("state")).unwrap();

        assert_eq!(store.get_block_summary(42).unwrap(), Hash::zero());
        let id = hash(b"block");
        store.set_block_summary(42, &id).unwrap();
        assert_eq!(store.get_block_summary(42).unwrap(), id);
    }
}
