// Durable key/value store with a stack of in-memory undo levels.
//
// The current state always lives in the sled trees: every mutation is
// applied immediately and the key's prior value is recorded in the top
// undo level. Undoing a level writes the prior values back; committing
// a revision merely drops the levels at or below it, making their
// writes unrevertable. This mirrors the layering both the chain-state
// store and the token store are built on.

use std::{collections::HashMap, path::Path};

use log::trace;
use sled::IVec;

use crate::error::ChainError;

const META_TREE: &str = "__meta";
const META_REVISION_KEY: &[u8] = b"revision";

struct UndoLevel {
    revision: u64,
    enabled: bool,
    // First prior value seen per (tree, key); None means the key was absent
    prior: HashMap<(usize, IVec), Option<IVec>>,
}

pub struct UndoStore {
    _db: sled::Db,
    trees: Vec<sled::Tree>,
    meta: sled::Tree,
    levels: Vec<UndoLevel>,
    revision: u64,
}

impl UndoStore {
    pub fn open<P: AsRef<Path>>(path: P, tree_names: &[&str]) -> Result<Self, ChainError> {
        let db = sled::open(path)?;
        let mut trees = Vec::with_capacity(tree_names.len());
        for name in tree_names {
            trees.push(db.open_tree(name)?);
        }
        let meta = db.open_tree(META_TREE)?;
        let revision = match meta.get(META_REVISION_KEY)? {
            Some(bytes) => u64::from_le_bytes(
                bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| ChainError::StorageInconsistent("bad revision marker".into()))?,
            ),
            None => 0,
        };
        Ok(Self {
            _db: db,
            trees,
            meta,
            levels: Vec::new(),
            revision,
        })
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    // Only valid while no undo level is open
    pub fn set_revision(&mut self, revision: u64) -> Result<(), ChainError> {
        if !self.levels.is_empty() {
            return Err(ChainError::StorageInconsistent(
                "cannot set revision with open undo sessions".into(),
            ));
        }
        self.revision = revision;
        self.meta.insert(META_REVISION_KEY, &revision.to_le_bytes()[..])?;
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.levels.len()
    }

    // Begin a new undo level and return its revision. A disabled level
    // keeps the stack discipline but records nothing.
    pub fn start_undo_session(&mut self, enabled: bool) -> u64 {
        let revision = self.revision + 1;
        self.push_level(revision, enabled);
        revision
    }

    // Begin a level under an externally supplied revision tag
    pub fn push_level(&mut self, revision: u64, enabled: bool) {
        trace!("start undo session at revision {}", revision);
        self.revision = revision;
        self.levels.push(UndoLevel {
            revision,
            enabled,
            prior: HashMap::new(),
        });
    }

    pub fn latest_level_revision(&self) -> Option<u64> {
        self.levels.last().map(|level| level.revision)
    }

    // Merge the top level into its parent. For keys recorded in both,
    // the parent's prior value wins.
    pub fn squash(&mut self) -> Result<(), ChainError> {
        let top = self
            .levels
            .pop()
            .ok_or_else(|| ChainError::StorageInconsistent("squash without a session".into()))?;
        let parent = self.levels.last_mut().ok_or_else(|| {
            ChainError::StorageInconsistent("squash without a parent session".into())
        })?;
        if parent.enabled {
            for (key, prior) in top.prior {
                parent.prior.entry(key).or_insert(prior);
            }
        }
        self.revision = top.revision - 1;
        Ok(())
    }

    // Revert every write of the top level and pop it
    pub fn undo(&mut self) -> Result<(), ChainError> {
        let top = self
            .levels
            .pop()
            .ok_or_else(|| ChainError::StorageInconsistent("undo without a session".into()))?;
        trace!("undo revision {}", top.revision);
        for ((tree, key), prior) in top.prior {
            match prior {
                Some(value) => {
                    self.trees[tree].insert(key, value)?;
                }
                None => {
                    self.trees[tree].remove(key)?;
                }
            }
        }
        self.revision = top.revision - 1;
        Ok(())
    }

    pub fn undo_all(&mut self) -> Result<(), ChainError> {
        while !self.levels.is_empty() {
            self.undo()?;
        }
        Ok(())
    }

    // Make every level with revision <= n permanent
    pub fn commit(&mut self, revision: u64) -> Result<(), ChainError> {
        trace!("commit store to revision {}", revision);
        while let Some(level) = self.levels.first() {
            if level.revision > revision {
                break;
            }
            self.levels.remove(0);
        }
        let committed = match self.levels.first() {
            Some(level) => level.revision - 1,
            None => self.revision,
        };
        self.meta.insert(META_REVISION_KEY, &committed.to_le_bytes()[..])?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), ChainError> {
        for tree in &self.trees {
            tree.flush()?;
        }
        self.meta.flush()?;
        Ok(())
    }

    pub fn get(&self, tree: usize, key: &[u8]) -> Result<Option<IVec>, ChainError> {
        Ok(self.trees[tree].get(key)?)
    }

    pub fn contains(&self, tree: usize, key: &[u8]) -> Result<bool, ChainError> {
        Ok(self.trees[tree].contains_key(key)?)
    }

    pub fn insert(&mut self, tree: usize, key: &[u8], value: &[u8]) -> Result<(), ChainError> {
        let prior = self.trees[tree].insert(key, value)?;
        self.record(tree, key, prior);
        Ok(())
    }

    pub fn remove(&mut self, tree: usize, key: &[u8]) -> Result<(), ChainError> {
        let prior = self.trees[tree].remove(key)?;
        self.record(tree, key, prior);
        Ok(())
    }

    // Read-only view for range scans; writes must go through the store
    pub fn tree(&self, tree: usize) -> &sled::Tree {
        &self.trees[tree]
    }

    fn record(&mut self, tree: usize, key: &[u8], prior: Option<IVec>) {
        if let Some(level) = self.levels.last_mut() {
            if level.enabled {
                level
                    .prior
                    .entry((tree, IVec::from(key)))
                    .or_insert(prior);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn open_store(dir: &TempDir) -> UndoStore {
        UndoStore::open(dir.path().join("db"), &["data"]).unwrap()
    }

    #[test]
    fn test_undo_restores_prior_values() {
        let dir = TempDir::new("undo-store").unwrap();
        let mut store = open_store(&dir);

        store.insert(0, b"a", b"1").unwrap();
        store.start_undo_session(true);
        store.insert(0, b"a", b"2").unwrap();
        store.insert(0, b"b", b"3").unwrap();
        store.remove(0, b"a").unwrap();

        store.undo().unwrap();
        assert_eq!(store.get(0, b"a").unwrap().unwrap().as_ref(), b"1");
        assert!(store.get(0, b"b").unwrap().is_none());
    }

    #[test]
    fn test_squash_keeps_parent_prior() {
        let dir = TempDir::new("undo-store").unwrap();
        let mut store = open_store(&dir);

        store.insert(0, b"a", b"1").unwrap();
        store.start_undo_session(true);
        store.insert(0, b"a", b"2").unwrap();
        store.start_undo_session(true);
        store.insert(0, b"a", b"3").unwrap();

        // The squashed level folds into its parent; undoing the parent
        // goes all the way back to the value before both sessions
        store.squash().unwrap();
        store.undo().unwrap();
        assert_eq!(store.get(0, b"a").unwrap().unwrap().as_ref(), b"1");
    }

    #[test]
    fn test_commit_drops_levels() {
        let dir = TempDir::new("undo-store").unwrap();
        let mut store = open_store(&dir);

        let r1 = store.start_undo_session(true);
        store.insert(0, b"a", b"1").unwrap();
        store.start_undo_session(true);
        store.insert(0, b"b", b"2").unwrap();

        store.commit(r1).unwrap();
        assert_eq!(store.session_count(), 1);

        // The second level is still revertable
        store.undo().unwrap();
        assert_eq!(store.get(0, b"a").unwrap().unwrap().as_ref(), b"1");
        assert!(store.get(0, b"b").unwrap().is_none());

        // The first is not
        assert!(store.undo().is_err());
    }

    #[test]
    fn test_disabled_session_records_nothing() {
        let dir = TempDir::new("undo-store").unwrap();
        let mut store = open_store(&dir);

        store.start_undo_session(false);
        store.insert(0, b"a", b"1").unwrap();
        store.undo().unwrap();
        assert_eq!(store.get(0, b"a").unwrap().unwrap().as_ref(), b"1");
    }

    #[test]
    fn test_revision_tracking() {
        let dir = TempDir::new("undo-store").unwrap();
        let mut store = open_store(&dir);

        store.set_revision(10).unwrap();
        assert_eq!(store.start_undo_session(true), 11);
        assert_eq!(store.start_undo_session(true), 12);
        store.squash().unwrap();
        assert_eq!(store.revision(), 11);
        store.undo().unwrap();
        assert_eq!(store.revision(), 10);

        store.start_undo_session(true);
        assert!(store.set_revision(5).is_err());
    }
}
