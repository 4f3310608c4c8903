// The block-chain state controller: owns both stores, the fork
// database, the block log and the pending block, and drives block
// production, block application, fork choice and irreversibility.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Instant,
};

use indexmap::IndexMap;
use log::{debug, error, info, warn};
use sigil_common::{
    block::{
        merkle, num_from_id, HeaderConfirmation, SignedBlock, SignedBlockHeader,
        TransactionReceipt, TransactionStatus,
    },
    crypto::{Hash, Hashable, PublicKey, Signature},
    name::Name,
    producer::{ProducerKey, ProducerSchedule},
    time::BlockTimestamp,
    token::DomainDef,
    transaction::Transaction,
};

use crate::{
    block_log::BlockLog,
    block_state::{BlockHeaderState, BlockState},
    config::Config,
    contracts::{self, ApplyHandler},
    authority_checker::AuthorityChecker,
    error::ChainError,
    fork_db::ForkDatabase,
    metadata::{RecoveryCache, TransactionMetadata},
    reversible::ReversibleBlockStore,
    signal::Signal,
    state::{ChainStore, DynamicGlobalProperty, GlobalProperty},
    tokendb::TokenStore,
    trx_context::{TransactionContext, TransactionTrace},
};

// Producer name carried by the genesis schedule
const GENESIS_PRODUCER: Name = Name::constant("sigil");

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockStatus {
    // Part of the irreversible chain
    Irreversible,
    // Validated by this node before, part of a known chain
    Validated,
    // Complete block received from the outside, not validated yet
    Complete,
    // Block under construction
    Incomplete,
}

// State that only exists between start_block and commit/abort
struct PendingState {
    header_state: BlockHeaderState,
    block: SignedBlock,
    trxs: Vec<Arc<TransactionMetadata>>,
    actions: Vec<crate::trx_context::ActionReceipt>,
    block_status: BlockStatus,
}

pub struct Signals {
    pub accepted_block_header: Signal<Arc<BlockState>>,
    pub accepted_block: Signal<Arc<BlockState>>,
    pub irreversible_block: Signal<Arc<BlockState>>,
    pub accepted_transaction: Signal<Arc<TransactionMetadata>>,
    pub applied_transaction: Signal<Arc<TransactionTrace>>,
    pub accepted_confirmation: Signal<HeaderConfirmation>,
}

impl Signals {
    fn new() -> Self {
        Self {
            accepted_block_header: Signal::new("accepted_block_header"),
            accepted_block: Signal::new("accepted_block"),
            irreversible_block: Signal::new("irreversible_block"),
            accepted_transaction: Signal::new("accepted_transaction"),
            applied_transaction: Signal::new("applied_transaction"),
            accepted_confirmation: Signal::new("accepted_confirmation"),
        }
    }
}

pub struct Controller {
    config: Config,
    chain_id: Hash,
    chain_store: ChainStore,
    token_db: TokenStore,
    reversible_blocks: ReversibleBlockStore,
    blog: BlockLog,
    fork_db: ForkDatabase,
    head: Arc<BlockState>,
    pending: Option<PendingState>,
    apply_handlers: HashMap<Name, ApplyHandler>,
    // Transactions undone by pop_block or abort_block; producers pick
    // candidates from here when scheduling new blocks
    unapplied_transactions: IndexMap<Hash, Arc<TransactionMetadata>>,
    recovery_cache: RecoveryCache,
    replaying: bool,
    shut_down: bool,
    pub signals: Signals,
}

impl Controller {
    // Open every store, install genesis when starting fresh, then
    // replay the block log and the reversible blocks
    pub fn new(config: Config) -> Result<Self, ChainError> {
        config.genesis.initial_configuration.validate()?;
        let chain_id = config.genesis.compute_chain_id();

        // fork_db.dat sits next to the chain-state trees under state_dir
        let chain_store = ChainStore::open(config.state_dir.join("chainstate"))?;
        let token_db = TokenStore::open(&config.tokendb_dir)?;
        let reversible_blocks = ReversibleBlockStore::open(config.reversible_blocks_dir())?;
        let blog = BlockLog::open(&config.blocks_dir)?;
        let fork_db = ForkDatabase::open(&config.state_dir)?;

        let genesis_state = Self::genesis_block_state(&config, &chain_id);
        let mut controller = Self {
            config,
            chain_id,
            chain_store,
            token_db,
            reversible_blocks,
            blog,
            fork_db,
            head: Arc::new(genesis_state),
            pending: None,
            apply_handlers: contracts::build_apply_handlers(),
            unapplied_transactions: IndexMap::new(),
            recovery_cache: RecoveryCache::new(),
            replaying: false,
            shut_down: false,
            signals: Signals::new(),
        };
        controller.init()?;
        Ok(controller)
    }

    fn init(&mut self) -> Result<(), ChainError> {
        match self.fork_db.head() {
            Some(state) => {
                self.head = Arc::new(state.clone());
            }
            None => {
                self.initialize_fork_db()?;
                self.initialize_token_db()?;
            }
        }

        // Catch up with the block log, then with the reversible blocks
        match self.blog.head_block_num() {
            Some(log_head) if log_head > self.head.block_num() => {
                self.replaying = true;
                info!("existing block log, replaying up to block {}", log_head);
                let start = Instant::now();
                while let Some(next) = self.blog.read_block_by_num(self.head.block_num() + 1)? {
                    self.push_block_internal(Arc::new(next), BlockStatus::Irreversible)?;
                    if self.head.block_num() % 1000 == 0 {
                        debug!("replayed {} of {}", self.head.block_num(), log_head);
                    }
                }
                info!(
                    "replayed {} blocks in {} ms",
                    self.head.block_num(),
                    start.elapsed().as_millis()
                );
                self.replaying = false;
            }
            Some(_) => {}
            None => {
                self.blog.reset_to_genesis(&self.head.block)?;
            }
        }

        self.replaying = true;
        let mut reversible = 0;
        while let Some(block) = self.reversible_blocks.get(self.head.block_num() + 1)? {
            self.push_block_internal(Arc::new(block), BlockStatus::Validated)?;
            reversible += 1;
        }
        self.replaying = false;
        if reversible > 0 {
            info!("{} reversible blocks replayed", reversible);
        }

        // Consistency between the stores, the fork database and the log
        match self.reversible_blocks.last_block_num()? {
            Some(tip) => {
                if tip != self.head.block_num() {
                    return Err(ChainError::StorageInconsistent(format!(
                        "reversible block database tip {} does not match head {}, replay blockchain",
                        tip,
                        self.head.block_num()
                    )));
                }
            }
            None => {
                let log_head = self.blog.head_block_num().ok_or_else(|| {
                    ChainError::StorageInconsistent("block log is empty after startup".into())
                })?;
                if log_head != self.head.block_num() {
                    return Err(ChainError::StorageInconsistent(format!(
                        "block log head {} does not match head {} and no reversible blocks exist",
                        log_head,
                        self.head.block_num()
                    )));
                }
            }
        }
        if self.chain_store.revision() != self.head.block_num() as u64 {
            return Err(ChainError::StorageInconsistent(format!(
                "state revision {} does not match head {}, replay from a clean data directory",
                self.chain_store.revision(),
                self.head.block_num()
            )));
        }

        info!(
            "chain {} started at block {}",
            self.chain_id,
            self.head.block_num()
        );
        Ok(())
    }

    // The block state every fresh chain starts from
    fn genesis_block_state(config: &Config, chain_id: &Hash) -> BlockState {
        let genesis = &config.genesis;
        let initial_schedule = ProducerSchedule::new(
            0,
            vec![ProducerKey {
                producer_name: GENESIS_PRODUCER,
                block_signing_key: genesis.initial_key.clone(),
            }],
        );
        let header_state = BlockHeaderState::genesis(
            genesis.initial_timestamp,
            initial_schedule,
            chain_id.clone(),
        );
        let block = Arc::new(SignedBlock::new(SignedBlockHeader {
            header: header_state.header.clone(),
            producer_signature: header_state.producer_signature.clone(),
        }));
        BlockState::new(header_state, block)
    }

    // Fresh chain: derive the genesis state and seed every store
    fn initialize_fork_db(&mut self) -> Result<(), ChainError> {
        warn!("initializing new blockchain with genesis state");
        let state = Self::genesis_block_state(&self.config, &self.chain_id);

        self.fork_db.set_root(state.clone());
        self.head = Arc::new(state);
        self.chain_store.set_revision(self.head.block_num() as u64)?;

        // TaPoS slot of the genesis block
        let slot = (self.head.block_num() & 0xffff) as u16;
        self.chain_store.set_block_summary(slot, self.head.id())?;

        self.chain_store.set_global_property(&GlobalProperty {
            configuration: self.config.genesis.initial_configuration.clone(),
            proposed_schedule_block_num: None,
            proposed_schedule: ProducerSchedule::default(),
        })?;
        self.chain_store
            .set_dynamic_global_property(&DynamicGlobalProperty::default())?;
        Ok(())
    }

    fn initialize_token_db(&mut self) -> Result<(), ChainError> {
        let issuer = self.config.genesis.initial_key.clone();
        let issue_time = self.config.genesis.initial_timestamp.to_time_point_sec();
        for name in [
            contracts::DOMAIN_DOMAIN,
            contracts::DOMAIN_GROUP,
            contracts::DOMAIN_ACCOUNT,
            contracts::DOMAIN_DELAY,
        ] {
            if !self.token_db.exists_domain(&name)? {
                self.token_db
                    .add_domain(&DomainDef::issued_by(name, issuer.clone(), issue_time))?;
            }
        }
        Ok(())
    }

    // Block production lifecycle

    pub fn start_block(
        &mut self,
        when: BlockTimestamp,
        confirm_count: u16,
        status: BlockStatus,
    ) -> Result<(), ChainError> {
        if self.pending.is_some() {
            return Err(ChainError::PendingBlockExists);
        }
        if self.chain_store.revision() != self.head.block_num() as u64 {
            return Err(ChainError::StorageInconsistent(format!(
                "state revision {} does not match head {}",
                self.chain_store.revision(),
                self.head.block_num()
            )));
        }

        self.chain_store.start_undo_session(!self.config.read_only);
        self.token_db
            .new_savepoint_session(self.chain_store.revision());

        match self.build_pending(when, confirm_count, status) {
            Ok(pending) => {
                self.pending = Some(pending);
                Ok(())
            }
            Err(e) => {
                // Discard the sessions opened above on every failure path
                self.chain_store.undo()?;
                self.token_db.rollback_to_latest_savepoint()?;
                Err(e)
            }
        }
    }

    fn build_pending(
        &mut self,
        when: BlockTimestamp,
        confirm_count: u16,
        status: BlockStatus,
    ) -> Result<PendingState, ChainError> {
        let mut header_state = self.head.header_state.generate_next(when)?;
        header_state.set_confirmed(confirm_count);
        let was_pending_promoted = header_state.maybe_promote_pending();

        let mut gpo = self.chain_store.get_global_property()?;
        if let Some(proposed_num) = gpo.proposed_schedule_block_num {
            // A proposed schedule becomes pending once its proposal block
            // is irreversible, the pending slot is free, and the slot was
            // not freed by a promotion in this very block
            if proposed_num <= header_state.dpos_irreversible_blocknum
                && header_state.pending_schedule.producers.is_empty()
                && !was_pending_promoted
            {
                if !self.replaying {
                    info!(
                        "promoting proposed schedule (set in block {}) to pending; current block: {} lib: {}",
                        proposed_num,
                        header_state.block_num,
                        header_state.dpos_irreversible_blocknum
                    );
                }
                header_state.set_new_producers(gpo.proposed_schedule.clone())?;
                gpo.proposed_schedule_block_num = None;
                gpo.proposed_schedule = ProducerSchedule::default();
                self.chain_store.set_global_property(&gpo)?;
            }
        }

        self.chain_store
            .evict_expired_transactions(when.to_time_point_sec())?;

        Ok(PendingState {
            block: SignedBlock::new(SignedBlockHeader {
                header: header_state.header.clone(),
                producer_signature: Signature::zero(),
            }),
            header_state,
            trxs: Vec::new(),
            actions: Vec::new(),
            block_status: status,
        })
    }

    pub fn push_transaction(
        &mut self,
        trx: &Arc<TransactionMetadata>,
        deadline: Option<Instant>,
    ) -> Result<Arc<TransactionTrace>, ChainError> {
        self.push_transaction_internal(trx, deadline, false, None)
    }

    // `billed` carries the resource figures from a received block's
    // receipt; re-measuring cpu locally would change the receipt digest
    // and with it the transaction merkle root
    fn push_transaction_internal(
        &mut self,
        trx: &Arc<TransactionMetadata>,
        deadline: Option<Instant>,
        implicit: bool,
        billed: Option<(u32, u32)>,
    ) -> Result<Arc<TransactionTrace>, ChainError> {
        let Some(pending) = &self.pending else {
            return Err(ChainError::NoPendingBlock);
        };
        let pending_block_time = pending.header_state.header.timestamp;
        let configuration = self.chain_store.get_global_property()?.configuration;

        let mut trx_context = TransactionContext::new(
            trx.id.clone(),
            configuration,
            pending_block_time,
            deadline,
            implicit,
            self.config.contracts_console,
        );
        trx_context.start_sessions(&mut self.chain_store, &mut self.token_db);

        let result = self.execute_transaction(&mut trx_context, trx, implicit);
        match result {
            Ok(()) => {
                let Some(pending) = self.pending.as_mut() else {
                    return Err(ChainError::NoPendingBlock);
                };
                // Snapshot so a late storage failure can unwind the block
                let restore = (
                    pending.block.transactions.len(),
                    pending.trxs.len(),
                    pending.actions.len(),
                );

                if !implicit {
                    let (cpu_usage_us, net_usage_words) =
                        billed.unwrap_or((trx_context.cpu_usage_us, trx_context.net_usage_words));
                    let receipt = TransactionReceipt {
                        status: TransactionStatus::Executed,
                        cpu_usage_us,
                        net_usage_words,
                        trx: trx.packed_trx.clone(),
                    };
                    pending.block.transactions.push(receipt.clone());
                    pending.trxs.push(trx.clone());
                    trx_context.trace.receipt = Some(receipt);
                }
                pending.actions.append(&mut trx_context.executed);

                if let Err(e) =
                    trx_context.squash_sessions(&mut self.chain_store, &mut self.token_db)
                {
                    let Some(pending) = self.pending.as_mut() else {
                        return Err(e);
                    };
                    pending.block.transactions.truncate(restore.0);
                    pending.trxs.truncate(restore.1);
                    pending.actions.truncate(restore.2);
                    return Err(e);
                }

                if !trx.accepted() {
                    self.signals.accepted_transaction.emit(trx);
                    trx.mark_accepted();
                }
                let trace = Arc::new(trx_context.trace);
                self.signals.applied_transaction.emit(&trace);

                if !implicit {
                    self.unapplied_transactions.shift_remove(&trx.signed_id);
                }
                Ok(trace)
            }
            Err(e) => {
                trx_context.undo_sessions(&mut self.chain_store, &mut self.token_db)?;
                let subjective = e.is_subjective();
                debug!("transaction {} failed: {}", trx.id, e);
                trx_context.trace.except = Some(e);
                // Objective failures will fail again; subjective ones may
                // succeed in a later block, so those stay eligible
                if !subjective {
                    self.unapplied_transactions.shift_remove(&trx.signed_id);
                }
                Ok(Arc::new(trx_context.trace))
            }
        }
    }

    fn execute_transaction(
        &mut self,
        trx_context: &mut TransactionContext,
        trx: &Arc<TransactionMetadata>,
        implicit: bool,
    ) -> Result<(), ChainError> {
        if !implicit {
            trx_context.init_for_input_trx(&mut self.chain_store, trx)?;
        }

        if !implicit && !self.skip_auth_check() {
            let max_depth = self
                .config
                .genesis
                .initial_configuration
                .max_authority_depth;
            let keys = trx.recover_keys(&self.chain_id, &mut self.recovery_cache)?;
            let mut checker = AuthorityChecker::new(keys, &self.token_db, max_depth);
            for action in &trx.trx.trx.actions {
                if !checker.satisfied(action)? {
                    return Err(ChainError::UnsatisfiedAuthorization {
                        domain: action.domain,
                        key: action.key,
                        name: action.name,
                    });
                }
            }
        }

        trx_context.exec(
            &mut self.chain_store,
            &mut self.token_db,
            &self.apply_handlers,
            &self.chain_id,
            trx,
        )?;
        trx_context.finalize(trx)?;
        Ok(())
    }

    // Compute the merkle roots, stamp the header id and write the TaPoS
    // summary slot
    pub fn finalize_block(&mut self) -> Result<(), ChainError> {
        let Some(pending) = self.pending.as_mut() else {
            return Err(ChainError::NoPendingBlock);
        };

        let action_digests = pending
            .actions
            .iter()
            .map(|receipt| receipt.hash())
            .collect();
        pending.header_state.header.action_mroot = merkle(action_digests);

        let trx_digests = pending
            .block
            .transactions
            .iter()
            .map(TransactionReceipt::digest)
            .collect();
        pending.header_state.header.transaction_mroot = merkle(trx_digests);

        pending.header_state.id = pending.header_state.header.id();

        let id = pending.header_state.id.clone();
        let slot = (num_from_id(&id) & 0xffff) as u16;
        self.chain_store.set_block_summary(slot, &id)?;
        Ok(())
    }

    pub fn sign_block<F>(&mut self, signer: F) -> Result<(), ChainError>
    where
        F: FnOnce(&Hash) -> Signature,
    {
        let Some(pending) = self.pending.as_mut() else {
            return Err(ChainError::NoPendingBlock);
        };
        pending.header_state.sign(signer)
    }

    pub fn commit_block(&mut self) -> Result<(), ChainError> {
        self.commit_block_internal(true)?;
        Ok(())
    }

    fn commit_block_internal(
        &mut self,
        add_to_fork_db: bool,
    ) -> Result<Arc<BlockState>, ChainError> {
        let Some(pending) = self.pending.as_mut() else {
            return Err(ChainError::NoPendingBlock);
        };

        pending.block.signed_header = SignedBlockHeader {
            header: pending.header_state.header.clone(),
            producer_signature: pending.header_state.producer_signature.clone(),
        };
        let block = Arc::new(pending.block.clone());
        let mut state = BlockState::new(pending.header_state.clone(), block.clone());
        state.in_current_chain = true;
        state.trxs = pending.trxs.clone();

        if add_to_fork_db {
            state.validated = true;
            let irreversible = self.fork_db.add_state(state.clone())?;
            for irreversible_state in &irreversible {
                self.on_irreversible(irreversible_state)?;
            }

            let shared = Arc::new(state.clone());
            self.signals.accepted_block_header.emit(&shared);

            let new_head = self
                .fork_db
                .head()
                .ok_or(ChainError::CommittedBlockNotHead)?;
            if new_head.id() != state.id() {
                return Err(ChainError::CommittedBlockNotHead);
            }
            self.head = Arc::new(new_head.clone());
        }

        let shared = Arc::new(state);
        self.signals.accepted_block.emit(&shared);

        if !self.replaying {
            self.reversible_blocks.insert(&block)?;
        }

        // The block's sessions stay on the undo stacks as this block's
        // revertable layer
        self.pending = None;
        Ok(shared)
    }

    // Move the pending block's transactions back to the unapplied pool
    // and discard its sessions
    pub fn abort_block(&mut self) -> Result<(), ChainError> {
        if let Some(pending) = self.pending.take() {
            for trx in &pending.trxs {
                self.unapplied_transactions
                    .insert(trx.signed_id.clone(), trx.clone());
            }
            self.chain_store.undo()?;
            self.token_db.rollback_to_latest_savepoint()?;
        }
        Ok(())
    }

    // Receiving side

    pub fn push_block(&mut self, block: SignedBlock, status: BlockStatus) -> Result<(), ChainError> {
        self.push_block_internal(Arc::new(block), status)
    }

    fn push_block_internal(
        &mut self,
        block: Arc<SignedBlock>,
        status: BlockStatus,
    ) -> Result<(), ChainError> {
        if self.pending.is_some() {
            return Err(ChainError::PendingBlockExists);
        }
        if status == BlockStatus::Incomplete {
            return Err(ChainError::StorageInconsistent(
                "cannot push an incomplete block".into(),
            ));
        }

        let trust = !self.config.force_all_checks
            && (status == BlockStatus::Irreversible || status == BlockStatus::Validated);
        let (state, irreversible) = self.fork_db.add_block(block, trust)?;
        for irreversible_state in &irreversible {
            self.on_irreversible(irreversible_state)?;
        }
        self.signals
            .accepted_block_header
            .emit(&Arc::new(state));

        self.maybe_switch_forks(status)
    }

    pub fn push_confirmation(
        &mut self,
        confirmation: HeaderConfirmation,
    ) -> Result<(), ChainError> {
        if self.pending.is_some() {
            return Err(ChainError::PendingBlockExists);
        }
        let irreversible = self.fork_db.add_confirmation(&confirmation)?;
        for irreversible_state in &irreversible {
            self.on_irreversible(irreversible_state)?;
        }
        self.signals.accepted_confirmation.emit(&confirmation);
        self.maybe_switch_forks(BlockStatus::Complete)
    }

    // Fork choice: follow the fork database's head, switching branches
    // when it leaves the current chain
    fn maybe_switch_forks(&mut self, status: BlockStatus) -> Result<(), ChainError> {
        let Some(new_head) = self.fork_db.head().cloned() else {
            return Ok(());
        };

        if new_head.previous() == self.head.id() {
            // Plain extension of the current chain
            let id = new_head.id().clone();
            match self.apply_block(new_head.block.clone(), status) {
                Ok(()) => {
                    self.fork_db.mark_in_current_chain(&id, true)?;
                    self.fork_db.set_validity(&id, true)?;
                    self.head = Arc::new(
                        self.fork_db
                            .get_block(&id)
                            .ok_or_else(|| ChainError::UnknownBlockId(id.clone()))?
                            .clone(),
                    );
                    self.process_deferred_irreversibility()
                }
                Err(e) => {
                    // Removes the block and every descendant from the index
                    self.fork_db.set_validity(&id, false)?;
                    Err(e)
                }
            }
        } else if new_head.id() != self.head.id() {
            info!(
                "switching forks from {} (block {}) to {} (block {})",
                self.head.id(),
                self.head.block_num(),
                new_head.id(),
                new_head.block_num()
            );
            let (branch_new, branch_old) = self
                .fork_db
                .fetch_branch_from(new_head.id(), self.head.id())?;

            for state in &branch_old {
                self.fork_db.mark_in_current_chain(state.id(), false)?;
                self.pop_block()?;
            }
            let fork_point = branch_old
                .last()
                .map(BlockState::previous)
                .ok_or_else(|| {
                    ChainError::StorageInconsistent("fork switch with an empty old branch".into())
                })?;
            if self.head.id() != fork_point {
                return Err(ChainError::StorageInconsistent(
                    "loss of sync between fork database and chain state during fork switch".into(),
                ));
            }

            let mut applied: Vec<Hash> = Vec::new();
            for state in branch_new.iter().rev() {
                let block_status = if state.validated {
                    BlockStatus::Validated
                } else {
                    BlockStatus::Complete
                };
                match self.apply_block(state.block.clone(), block_status) {
                    Ok(()) => {
                        self.fork_db.mark_in_current_chain(state.id(), true)?;
                        self.fork_db.set_validity(state.id(), true)?;
                        self.head = Arc::new(
                            self.fork_db
                                .get_block(state.id())
                                .ok_or_else(|| ChainError::UnknownBlockId(state.id().clone()))?
                                .clone(),
                        );
                        applied.push(state.id().clone());
                    }
                    Err(e) => {
                        error!("exception thrown while switching forks: {}", e);
                        return self.revert_fork_switch(e, state.id(), applied, &branch_old);
                    }
                }
            }
            info!("successfully switched fork to new head {}", new_head.id());
            self.process_deferred_irreversibility()
        } else {
            Ok(())
        }
    }

    // Irreversibility that waited for a confirmed branch to be applied
    fn process_deferred_irreversibility(&mut self) -> Result<(), ChainError> {
        let deferred = self.fork_db.check_irreversibility()?;
        for state in &deferred {
            self.on_irreversible(state)?;
        }
        Ok(())
    }

    // A failed switch must restore the pre-switch head exactly
    fn revert_fork_switch(
        &mut self,
        original: ChainError,
        failed_id: &Hash,
        applied: Vec<Hash>,
        branch_old: &[BlockState],
    ) -> Result<(), ChainError> {
        let result: Result<(), ChainError> = (|| {
            // Marking the failed block invalid also drops its descendants
            self.fork_db.set_validity(failed_id, false)?;

            for id in applied.iter().rev() {
                // The branch's transactions never made it into a surviving
                // block; forget them so the unapplied pool matches its
                // pre-switch contents
                let popped_trxs: Vec<Hash> = self
                    .fork_db
                    .get_block(id)
                    .map(|state| state.trxs.iter().map(|t| t.signed_id.clone()).collect())
                    .unwrap_or_default();
                self.fork_db.mark_in_current_chain(id, false)?;
                self.pop_block()?;
                for signed_id in popped_trxs {
                    self.unapplied_transactions.shift_remove(&signed_id);
                }
            }
            let fork_point = branch_old
                .last()
                .map(BlockState::previous)
                .ok_or_else(|| {
                    ChainError::StorageInconsistent("fork revert with an empty old branch".into())
                })?;
            if self.head.id() != fork_point {
                return Err(ChainError::StorageInconsistent(
                    "loss of sync between fork database and chain state during fork revert".into(),
                ));
            }

            for state in branch_old.iter().rev() {
                // These were validated before the switch began
                self.apply_block(state.block.clone(), BlockStatus::Validated)?;
                self.fork_db.mark_in_current_chain(state.id(), true)?;
                self.head = Arc::new(
                    self.fork_db
                        .get_block(state.id())
                        .ok_or_else(|| ChainError::UnknownBlockId(state.id().clone()))?
                        .clone(),
                );
            }
            Ok(())
        })();

        match result {
            Ok(()) => Err(original),
            // The revert itself failing leaves no consistent state to
            // return to; the node must stop
            Err(revert_error) => {
                error!("fork switch revert failed: {}", revert_error);
                Err(ChainError::ForkSwitchRevert(Box::new(revert_error)))
            }
        }
    }

    // Re-execute a received block on top of the current head
    fn apply_block(&mut self, block: Arc<SignedBlock>, status: BlockStatus) -> Result<(), ChainError> {
        let result = self.apply_block_inner(&block, status);
        if let Err(e) = &result {
            error!("failed to apply block {}: {}", block.block_num(), e);
            self.abort_block()?;
        }
        result
    }

    fn apply_block_inner(
        &mut self,
        block: &Arc<SignedBlock>,
        status: BlockStatus,
    ) -> Result<(), ChainError> {
        if !block.block_extensions.is_empty() {
            return Err(ChainError::UnsupportedExtensions { id: block.id() });
        }

        self.start_block(block.header().timestamp, block.header().confirmed, status)?;

        for receipt in &block.transactions {
            let metadata = Arc::new(TransactionMetadata::from_packed(receipt.trx.clone())?);
            let billed = Some((receipt.cpu_usage_us, receipt.net_usage_words));
            let trace = self.push_transaction_internal(&metadata, None, false, billed)?;
            if let Some(e) = &trace.except {
                // A transaction that fails during block application fails
                // the whole block
                return Err(ChainError::BlockApplyTrxFailed {
                    num: block.block_num(),
                    id: metadata.id.clone(),
                    reason: e.to_string(),
                });
            }
        }

        self.finalize_block()?;

        let Some(pending) = &self.pending else {
            return Err(ChainError::NoPendingBlock);
        };
        let computed = &pending.header_state.header;
        let received = block.header();
        if computed.transaction_mroot != received.transaction_mroot {
            return Err(ChainError::TransactionMrootMismatch {
                num: block.block_num(),
                expected: received.transaction_mroot.clone(),
                computed: computed.transaction_mroot.clone(),
            });
        }
        if computed.action_mroot != received.action_mroot {
            return Err(ChainError::ActionMrootMismatch {
                num: block.block_num(),
                expected: received.action_mroot.clone(),
                computed: computed.action_mroot.clone(),
            });
        }

        // Adopt the received signature; verification against the
        // scheduled producer's key is implied by recovery
        let signature = block.signed_header.producer_signature.clone();
        self.sign_block(move |_| signature)?;

        let state = self.commit_block_internal(false)?;
        self.fork_db.set_trxs(state.id(), state.trxs.clone())?;
        Ok(())
    }

    // Undo the current head block and return its transactions to the
    // unapplied pool
    pub fn pop_block(&mut self) -> Result<(), ChainError> {
        let previous = self
            .fork_db
            .get_block(self.head.previous())
            .cloned()
            .ok_or(ChainError::PopBeyondLib)?;

        self.reversible_blocks.remove(self.head.block_num())?;
        for trx in &self.head.trxs {
            self.unapplied_transactions
                .insert(trx.signed_id.clone(), trx.clone());
        }
        self.head = Arc::new(previous);
        self.chain_store.undo()?;
        self.token_db.rollback_to_latest_savepoint()?;
        Ok(())
    }

    // Irreversibility: commit the stores, extend the block log, purge
    // the reversible rows
    fn on_irreversible(&mut self, state: &BlockState) -> Result<(), ChainError> {
        debug!("block {} is irreversible", state.block_num());
        let shared = Arc::new(state.clone());
        self.signals.irreversible_block.emit(&shared);

        self.chain_store.commit(state.block_num() as u64)?;
        self.token_db.pop_savepoints(state.block_num() as u64)?;

        let log_head_num = self.blog.head_block_num().ok_or_else(|| {
            ChainError::StorageInconsistent("block log has no head".into())
        })?;
        if state.block_num() > log_head_num {
            if state.block_num() != log_head_num + 1 {
                return Err(ChainError::BlockLogOutOfOrder {
                    appending: state.block_num(),
                    head: log_head_num,
                });
            }
            let log_head_id = self
                .blog
                .head()
                .map(SignedBlock::id)
                .ok_or_else(|| ChainError::StorageInconsistent("block log has no head".into()))?;
            if *state.previous() != log_head_id {
                return Err(ChainError::StorageInconsistent(
                    "irreversible block does not link to the block log head".into(),
                ));
            }
            self.blog.append(&state.block)?;
        }

        self.reversible_blocks.prune_to(state.block_num())?;
        Ok(())
    }

    // Producer schedule proposals

    pub fn set_proposed_producers(
        &mut self,
        producers: Vec<ProducerKey>,
    ) -> Result<Option<u32>, ChainError> {
        let Some(pending) = &self.pending else {
            return Err(ChainError::NoPendingBlock);
        };
        let mut gpo = self.chain_store.get_global_property()?;
        let cur_block_num = self.head.block_num() + 1;

        if let Some(proposed_num) = gpo.proposed_schedule_block_num {
            if proposed_num != cur_block_num {
                // An earlier proposal is still waiting to become pending
                return Ok(None);
            }
            if gpo.proposed_schedule.producers == producers {
                return Ok(None);
            }
        }

        let (version, unchanged) = if pending.header_state.pending_schedule.producers.is_empty() {
            (
                pending.header_state.active_schedule.version + 1,
                pending.header_state.active_schedule.producers == producers,
            )
        } else {
            (
                pending.header_state.pending_schedule.version + 1,
                pending.header_state.pending_schedule.producers == producers,
            )
        };
        if unchanged {
            return Ok(None);
        }

        gpo.proposed_schedule_block_num = Some(cur_block_num);
        gpo.proposed_schedule = ProducerSchedule::new(version, producers);
        self.chain_store.set_global_property(&gpo)?;
        Ok(Some(version))
    }

    pub fn active_producers(&self) -> &ProducerSchedule {
        match &self.pending {
            Some(pending) => &pending.header_state.active_schedule,
            None => &self.head.header_state.active_schedule,
        }
    }

    pub fn pending_producers(&self) -> &ProducerSchedule {
        match &self.pending {
            Some(pending) => &pending.header_state.pending_schedule,
            None => &self.head.header_state.pending_schedule,
        }
    }

    pub fn proposed_producers(&self) -> Result<Option<ProducerSchedule>, ChainError> {
        let gpo = self.chain_store.get_global_property()?;
        Ok(gpo
            .proposed_schedule_block_num
            .map(|_| gpo.proposed_schedule))
    }

    // Validation helpers exposed to collaborators

    pub fn validate_expiration(&self, trx: &Transaction) -> Result<(), ChainError> {
        let configuration = self.chain_store.get_global_property()?.configuration;
        let now = self.pending_block_time()?.to_time_point_sec();
        if trx.expiration < now {
            return Err(ChainError::ExpiredTx {
                id: trx.id(),
                expiration: trx.expiration,
                now,
            });
        }
        if trx.expiration > now.plus_secs(configuration.max_transaction_lifetime) {
            return Err(ChainError::TxExpTooFar {
                id: trx.id(),
                expiration: trx.expiration,
                now,
                max_lifetime: configuration.max_transaction_lifetime,
            });
        }
        Ok(())
    }

    pub fn validate_tapos(&self, trx: &Transaction) -> Result<(), ChainError> {
        let summary = self.chain_store.get_block_summary(trx.ref_block_num)?;
        if !trx.verify_reference_block(&summary) {
            return Err(ChainError::InvalidRefBlock { id: trx.id() });
        }
        Ok(())
    }

    pub fn is_known_unexpired_transaction(&self, id: &Hash) -> Result<bool, ChainError> {
        self.chain_store.contains_transaction(id)
    }

    pub fn get_required_keys(
        &self,
        trx: &Transaction,
        candidate_keys: &BTreeSet<PublicKey>,
    ) -> Result<BTreeSet<PublicKey>, ChainError> {
        let max_depth = self
            .config
            .genesis
            .initial_configuration
            .max_authority_depth;
        let mut checker = AuthorityChecker::new(candidate_keys, &self.token_db, max_depth);
        for action in &trx.actions {
            if !checker.satisfied(action)? {
                return Err(ChainError::TxMissingSigs);
            }
        }
        Ok(checker.used_keys().clone())
    }

    pub fn skip_auth_check(&self) -> bool {
        self.replaying && !self.config.force_all_checks
    }

    pub fn contracts_console(&self) -> bool {
        self.config.contracts_console
    }

    // Read-only queries

    pub fn head_block_num(&self) -> u32 {
        self.head.block_num()
    }

    pub fn head_block_id(&self) -> Hash {
        self.head.id().clone()
    }

    pub fn head_block_time(&self) -> BlockTimestamp {
        self.head.header_state.header.timestamp
    }

    pub fn head_block_producer(&self) -> Name {
        self.head.header_state.header.producer
    }

    pub fn head_block_header(&self) -> &sigil_common::block::BlockHeader {
        &self.head.header_state.header
    }

    pub fn head_block_state(&self) -> Arc<BlockState> {
        self.head.clone()
    }

    pub fn pending_block_state(&self) -> Option<&BlockHeaderState> {
        self.pending.as_ref().map(|pending| &pending.header_state)
    }

    pub fn pending_block_time(&self) -> Result<BlockTimestamp, ChainError> {
        self.pending
            .as_ref()
            .map(|pending| pending.header_state.header.timestamp)
            .ok_or(ChainError::NoPendingBlock)
    }

    pub fn is_producing_block(&self) -> bool {
        matches!(
            &self.pending,
            Some(pending) if pending.block_status == BlockStatus::Incomplete
        )
    }

    pub fn last_irreversible_block_num(&self) -> u32 {
        self.head
            .header_state
            .dpos_irreversible_blocknum
            .max(self.head.header_state.bft_irreversible_blocknum)
    }

    pub fn last_irreversible_block_id(&self) -> Result<Hash, ChainError> {
        let lib_num = self.last_irreversible_block_num();
        let summary = self.chain_store.get_block_summary(lib_num as u16)?;
        if num_from_id(&summary) == lib_num {
            return Ok(summary);
        }
        self.fetch_block_by_number(lib_num)?
            .map(|block| block.id())
            .ok_or(ChainError::UnknownBlockNum(lib_num))
    }

    pub fn fetch_block_by_id(&self, id: &Hash) -> Result<Option<Arc<SignedBlock>>, ChainError> {
        if let Some(state) = self.fork_db.get_block(id) {
            return Ok(Some(state.block.clone()));
        }
        let by_num = self.fetch_block_by_number(num_from_id(id))?;
        Ok(by_num.filter(|block| block.id() == *id))
    }

    pub fn fetch_block_by_number(
        &self,
        block_num: u32,
    ) -> Result<Option<Arc<SignedBlock>>, ChainError> {
        if let Some(state) = self.fork_db.get_block_in_current_chain_by_num(block_num) {
            return Ok(Some(state.block.clone()));
        }
        Ok(self.blog.read_block_by_num(block_num)?.map(Arc::new))
    }

    pub fn fetch_block_state_by_id(&self, id: &Hash) -> Option<BlockState> {
        self.fork_db.get_block(id).cloned()
    }

    pub fn fetch_block_state_by_number(&self, block_num: u32) -> Option<BlockState> {
        self.fork_db
            .get_block_in_current_chain_by_num(block_num)
            .cloned()
    }

    pub fn get_block_id_for_num(&self, block_num: u32) -> Result<Hash, ChainError> {
        if let Some(state) = self.fork_db.get_block_in_current_chain_by_num(block_num) {
            return Ok(state.id().clone());
        }
        self.blog
            .read_block_by_num(block_num)?
            .map(|block| block.id())
            .ok_or(ChainError::UnknownBlockNum(block_num))
    }

    pub fn get_global_properties(&self) -> Result<GlobalProperty, ChainError> {
        self.chain_store.get_global_property()
    }

    pub fn get_dynamic_global_properties(&self) -> Result<DynamicGlobalProperty, ChainError> {
        self.chain_store.get_dynamic_global_property()
    }

    pub fn get_chain_id(&self) -> &Hash {
        &self.chain_id
    }

    pub fn get_unapplied_transactions(&self) -> Vec<Arc<TransactionMetadata>> {
        self.unapplied_transactions.values().cloned().collect()
    }

    pub fn drop_unapplied_transaction(&mut self, trx: &TransactionMetadata) {
        self.unapplied_transactions.shift_remove(&trx.signed_id);
    }

    pub fn token_db(&self) -> &TokenStore {
        &self.token_db
    }

    pub fn token_db_mut(&mut self) -> &mut TokenStore {
        &mut self.token_db
    }

    pub fn fork_db(&self) -> &ForkDatabase {
        &self.fork_db
    }

    pub fn block_log(&self) -> &BlockLog {
        &self.blog
    }

    // Always equal to the head block number between operations
    pub fn chain_state_revision(&self) -> u64 {
        self.chain_store.revision()
    }

    // Roll uncommitted layers back to the last irreversible block and
    // persist everything; the reversible store replays them on restart
    pub fn shutdown(&mut self) -> Result<(), ChainError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        self.abort_block()?;
        self.chain_store.undo_all()?;
        self.token_db.rollback_all()?;
        self.fork_db.close()?;
        self.chain_store.flush()?;
        self.token_db.flush()?;
        self.reversible_blocks.flush()?;
        Ok(())
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("controller shutdown failed: {}", e);
        }
    }
}
