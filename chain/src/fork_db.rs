// In-memory tree of block states above the last irreversible block.
// Nodes are held in an arena keyed by block id; `previous` is a lookup
// key, never a pointer. The node whose block became irreversible last
// is retained as the root.

use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info, warn};
use sigil_common::{
    block::{HeaderConfirmation, SignedBlock, SignedBlockHeader},
    crypto::Hash,
    serializer::{Reader, Serializer, Writer},
};

use crate::{
    block_state::{BlockHeaderState, BlockState},
    error::ChainError,
};

const FORK_DB_FILE: &str = "fork_db.dat";

pub struct ForkDatabase {
    dat_path: PathBuf,
    index: HashMap<Hash, BlockState>,
    by_prev: HashMap<Hash, Vec<Hash>>,
    by_num: BTreeSet<(u32, Hash)>,
    head_id: Option<Hash>,
    root_id: Option<Hash>,
}

impl ForkDatabase {
    pub fn open<P: AsRef<Path>>(state_dir: P) -> Result<Self, ChainError> {
        std::fs::create_dir_all(&state_dir)?;
        let dat_path = state_dir.as_ref().join(FORK_DB_FILE);
        let mut fork_db = Self {
            dat_path,
            index: HashMap::new(),
            by_prev: HashMap::new(),
            by_num: BTreeSet::new(),
            head_id: None,
            root_id: None,
        };
        fork_db.load()?;
        Ok(fork_db)
    }

    // Install the root state a fresh or reloaded database grows from
    pub fn set_root(&mut self, mut state: BlockState) {
        state.validated = true;
        state.in_current_chain = true;
        let id = state.id().clone();
        self.insert_node(state);
        self.root_id = Some(id.clone());
        self.head_id = Some(id);
    }

    pub fn head(&self) -> Option<&BlockState> {
        self.head_id.as_ref().and_then(|id| self.index.get(id))
    }

    pub fn root(&self) -> Option<&BlockState> {
        self.root_id.as_ref().and_then(|id| self.index.get(id))
    }

    pub fn get_block(&self, id: &Hash) -> Option<&BlockState> {
        self.index.get(id)
    }

    pub fn get_block_in_current_chain_by_num(&self, block_num: u32) -> Option<&BlockState> {
        self.by_num
            .range((block_num, Hash::zero())..=(block_num, Hash::new([0xff; 32])))
            .filter_map(|(_, id)| self.index.get(id))
            .find(|state| state.in_current_chain)
    }

    // Insert an already constructed block state. Returns the blocks that
    // became irreversible as a consequence, oldest first.
    pub fn add_state(&mut self, state: BlockState) -> Result<Vec<BlockState>, ChainError> {
        if self.index.contains_key(state.id()) {
            return Err(ChainError::DuplicateBlock(state.id().clone()));
        }
        if !self.index.contains_key(state.previous()) {
            return Err(ChainError::UnlinkableBlock {
                id: state.id().clone(),
            });
        }
        self.insert_node(state);
        self.refresh_head();
        self.advance_irreversibility()
    }

    // Validate a received block against its parent state and insert it.
    // Returns the new state and any blocks that became irreversible.
    pub fn add_block(
        &mut self,
        block: Arc<SignedBlock>,
        trust: bool,
    ) -> Result<(BlockState, Vec<BlockState>), ChainError> {
        let previous = self.index.get(&block.header().previous).ok_or_else(|| {
            ChainError::UnlinkableBlock { id: block.id() }
        })?;
        let header_state = previous.header_state.next(&block.signed_header, trust)?;
        let state = BlockState::new(header_state, block);
        let irreversible = self.add_state(state.clone())?;
        Ok((state, irreversible))
    }

    // Attach a BFT confirmation; enough of them advance bft
    // irreversibility on the block and everything above it
    pub fn add_confirmation(
        &mut self,
        confirmation: &HeaderConfirmation,
    ) -> Result<Vec<BlockState>, ChainError> {
        let state = self
            .index
            .get_mut(&confirmation.block_id)
            .ok_or_else(|| ChainError::UnknownBlockId(confirmation.block_id.clone()))?;
        state.header_state.add_confirmation(confirmation)?;

        let producers = state.header_state.active_schedule.producers.len();
        let threshold = producers * 2 / 3 + 1;
        if state.header_state.confirmations.len() >= threshold {
            let block_num = state.block_num();
            info!("block {} reached bft irreversibility", block_num);
            let start = state.id().clone();
            self.propagate_bft_irreversibility(&start, block_num);
            self.refresh_head();
            return self.advance_irreversibility();
        }
        Ok(Vec::new())
    }

    pub fn mark_in_current_chain(&mut self, id: &Hash, in_chain: bool) -> Result<(), ChainError> {
        let state = self
            .index
            .get_mut(id)
            .ok_or_else(|| ChainError::UnknownBlockId(id.clone()))?;
        state.in_current_chain = in_chain;
        Ok(())
    }

    // Marking a block invalid removes it and everything built on it
    pub fn set_validity(&mut self, id: &Hash, valid: bool) -> Result<(), ChainError> {
        if valid {
            let state = self
                .index
                .get_mut(id)
                .ok_or_else(|| ChainError::UnknownBlockId(id.clone()))?;
            state.validated = true;
        } else {
            self.remove(id);
            self.refresh_head();
        }
        Ok(())
    }

    pub fn set_trxs(
        &mut self,
        id: &Hash,
        trxs: Vec<Arc<crate::metadata::TransactionMetadata>>,
    ) -> Result<(), ChainError> {
        let state = self
            .index
            .get_mut(id)
            .ok_or_else(|| ChainError::UnknownBlockId(id.clone()))?;
        state.trxs = trxs;
        Ok(())
    }

    // The two chains from `a` and `b` down to their common ancestor,
    // each ordered descendant first, the ancestor itself excluded
    pub fn fetch_branch_from(
        &self,
        a: &Hash,
        b: &Hash,
    ) -> Result<(Vec<BlockState>, Vec<BlockState>), ChainError> {
        let mut first = self
            .index
            .get(a)
            .ok_or_else(|| ChainError::UnknownBlockId(a.clone()))?;
        let mut second = self
            .index
            .get(b)
            .ok_or_else(|| ChainError::UnknownBlockId(b.clone()))?;

        let mut branch_a = Vec::new();
        let mut branch_b = Vec::new();

        while first.block_num() > second.block_num() {
            branch_a.push(first.clone());
            first = self.parent_of(first)?;
        }
        while second.block_num() > first.block_num() {
            branch_b.push(second.clone());
            second = self.parent_of(second)?;
        }
        while first.previous() != second.previous() {
            branch_a.push(first.clone());
            branch_b.push(second.clone());
            first = self.parent_of(first)?;
            second = self.parent_of(second)?;
        }
        if first.id() != second.id() {
            branch_a.push(first.clone());
            branch_b.push(second.clone());
        }
        Ok((branch_a, branch_b))
    }

    // Persist the root state so a restart can rebuild from it
    pub fn close(&self) -> Result<(), ChainError> {
        let Some(root) = self.root() else {
            return Ok(());
        };
        let mut writer = Writer::new();
        root.header_state.write(&mut writer);
        root.block.write(&mut writer);
        std::fs::write(&self.dat_path, writer.as_bytes())?;
        debug!("fork database saved with root {}", root.block_num());
        Ok(())
    }

    fn load(&mut self) -> Result<(), ChainError> {
        if !self.dat_path.exists() {
            return Ok(());
        }
        let bytes = std::fs::read(&self.dat_path)?;
        let mut reader = Reader::new(&bytes);
        let header_state = match BlockHeaderState::read(&mut reader) {
            Ok(state) => state,
            Err(e) => {
                warn!("fork database file is corrupted, starting empty: {}", e);
                return Ok(());
            }
        };
        let block = match SignedBlock::read(&mut reader) {
            Ok(block) => block,
            Err(e) => {
                warn!("fork database file is corrupted, starting empty: {}", e);
                return Ok(());
            }
        };
        let state = BlockState::new(header_state, Arc::new(block));
        info!("fork database reloaded at block {}", state.block_num());
        self.set_root(state);
        Ok(())
    }

    fn parent_of(&self, state: &BlockState) -> Result<&BlockState, ChainError> {
        self.index.get(state.previous()).ok_or_else(|| {
            ChainError::StorageInconsistent("fork database branch walked off the tree".into())
        })
    }

    fn insert_node(&mut self, state: BlockState) {
        let id = state.id().clone();
        self.by_prev
            .entry(state.previous().clone())
            .or_default()
            .push(id.clone());
        self.by_num.insert((state.block_num(), id.clone()));
        self.index.insert(id, state);
    }

    // Remove one node, leaving its descendants in place
    fn remove_single(&mut self, id: &Hash) {
        if let Some(state) = self.index.remove(id) {
            self.by_num.remove(&(state.block_num(), id.clone()));
            if let Some(siblings) = self.by_prev.get_mut(state.previous()) {
                siblings.retain(|sibling| sibling != id);
            }
        }
        self.by_prev.remove(id);
        if self.head_id.as_ref() == Some(id) {
            self.head_id = None;
        }
    }

    // Remove a node and all of its descendants
    fn remove(&mut self, id: &Hash) {
        let mut queue = vec![id.clone()];
        while let Some(id) = queue.pop() {
            if let Some(children) = self.by_prev.remove(&id) {
                queue.extend(children);
            }
            if let Some(state) = self.index.remove(&id) {
                self.by_num.remove(&(state.block_num(), id.clone()));
                if let Some(siblings) = self.by_prev.get_mut(state.previous()) {
                    siblings.retain(|sibling| *sibling != id);
                }
            }
            if self.head_id.as_ref() == Some(&id) {
                self.head_id = None;
            }
        }
    }

    // Best head: highest irreversibility, then highest number, then
    // lowest id
    fn refresh_head(&mut self) {
        fn irreversibility(state: &BlockState) -> u32 {
            state
                .header_state
                .dpos_irreversible_blocknum
                .max(state.header_state.bft_irreversible_blocknum)
        }
        let best = self.index.values().max_by(|a, b| {
            (
                irreversibility(a),
                a.block_num(),
                std::cmp::Reverse(a.id().clone()),
            )
                .cmp(&(irreversibility(b), b.block_num(), std::cmp::Reverse(b.id().clone())))
        });
        self.head_id = best.map(|state| state.id().clone());
    }

    fn propagate_bft_irreversibility(&mut self, from: &Hash, block_num: u32) {
        let mut queue = vec![from.clone()];
        while let Some(id) = queue.pop() {
            if let Some(state) = self.index.get_mut(&id) {
                if state.header_state.bft_irreversible_blocknum < block_num {
                    state.header_state.bft_irreversible_blocknum = block_num;
                }
            }
            if let Some(children) = self.by_prev.get(&id) {
                queue.extend(children.iter().cloned());
            }
        }
    }

    // Re-check irreversibility after blocks changed chain membership,
    // e.g. once a fork switch has applied a confirmed branch
    pub fn check_irreversibility(&mut self) -> Result<Vec<BlockState>, ChainError> {
        self.advance_irreversibility()
    }

    // When the head's irreversibility passes the root, every block on
    // the head's ancestry up to the new irreversible number leaves the
    // tree; the newest of them becomes the new root. Returned oldest
    // first, each exactly once. Blocks that have not been applied to the
    // chain state yet defer the advance until they have.
    fn advance_irreversibility(&mut self) -> Result<Vec<BlockState>, ChainError> {
        let Some(head) = self.head() else {
            return Ok(Vec::new());
        };
        let Some(root_num) = self.root().map(BlockState::block_num) else {
            return Ok(Vec::new());
        };
        let lib = head
            .header_state
            .dpos_irreversible_blocknum
            .max(head.header_state.bft_irreversible_blocknum);
        if lib <= root_num {
            return Ok(Vec::new());
        }

        // Walk the head's ancestry collecting blocks at or below lib
        let mut newly_irreversible = Vec::new();
        let mut cursor = head;
        while cursor.block_num() > root_num {
            if cursor.block_num() <= lib {
                if !cursor.in_current_chain {
                    return Ok(Vec::new());
                }
                newly_irreversible.push(cursor.clone());
            }
            cursor = self.parent_of(cursor)?;
        }
        newly_irreversible.reverse();

        let Some(new_root_id) = newly_irreversible.last().map(|s| s.id().clone()) else {
            return Ok(Vec::new());
        };

        // The old root and the irreversible blocks below the new root all
        // leave the tree. Competing branches hanging off them die with
        // their whole subtree; the path itself is removed node by node so
        // the cascade never reaches the new root.
        let mut path: Vec<Hash> = newly_irreversible
            .iter()
            .map(|state| state.id().clone())
            .collect();
        if let Some(old_root) = self.root_id.clone() {
            path.insert(0, old_root);
        }
        let on_path: std::collections::HashSet<Hash> = path.iter().cloned().collect();
        for id in &path {
            if *id == new_root_id {
                continue;
            }
            let children = self.by_prev.get(id).cloned().unwrap_or_default();
            for child in children {
                if !on_path.contains(&child) && child != new_root_id {
                    self.remove(&child);
                }
            }
            self.remove_single(id);
        }
        self.root_id = Some(new_root_id);
        self.refresh_head();

        debug!(
            "irreversibility advanced from {} to {}",
            root_num, lib
        );
        Ok(newly_irreversible)
    }
}

// Used by tests and the controller to rebuild states from raw parts
impl ForkDatabase {
    pub fn contains(&self, id: &Hash) -> bool {
        self.index.contains_key(id)
    }
}
