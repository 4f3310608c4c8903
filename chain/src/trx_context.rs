// Per-transaction execution scope: validates the input transaction,
// dispatches its actions under a nested session on both stores, and
// accounts for the resources it used.

use std::{
    collections::HashMap,
    time::Instant,
};

use log::trace;
use sigil_common::{
    block::TransactionReceipt,
    config::{ChainConfig, FIXED_NET_OVERHEAD_OF_PACKED_TRX, NET_USAGE_WORD_SIZE},
    crypto::{Hash, Hashable},
    name::Name,
    serializer::{Reader, ReaderError, Serializer, Writer},
    time::BlockTimestamp,
    transaction::Action,
};

use crate::{
    contracts::{ApplyContext, ApplyHandler},
    error::ChainError,
    metadata::TransactionMetadata,
    state::ChainStore,
    tokendb::TokenStore,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionReceipt {
    pub act_digest: Hash,
    pub global_sequence: u64,
    pub recv_sequence: u64,
}

impl Serializer for ActionReceipt {
    fn write(&self, writer: &mut Writer) {
        self.act_digest.write(writer);
        writer.write_u64(self.global_sequence);
        writer.write_u64(self.recv_sequence);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            act_digest: Hash::read(reader)?,
            global_sequence: reader.read_u64()?,
            recv_sequence: reader.read_u64()?,
        })
    }

    fn size(&self) -> usize {
        self.act_digest.size() + 8 + 8
    }
}

impl Hashable for ActionReceipt {}

#[derive(Debug)]
pub struct ActionTrace {
    pub receipt: ActionReceipt,
    pub act: Action,
    pub elapsed_us: u64,
    pub console: String,
}

#[derive(Debug)]
pub struct TransactionTrace {
    pub id: Hash,
    pub receipt: Option<TransactionReceipt>,
    pub action_traces: Vec<ActionTrace>,
    pub elapsed_us: u64,
    pub net_usage: u64,
    pub except: Option<ChainError>,
}

impl TransactionTrace {
    fn new(id: Hash) -> Self {
        Self {
            id,
            receipt: None,
            action_traces: Vec::new(),
            elapsed_us: 0,
            net_usage: 0,
            except: None,
        }
    }
}

pub struct TransactionContext {
    pub trace: TransactionTrace,
    // Receipts accumulated in execution order, moved into the pending
    // block once the transaction sticks
    pub executed: Vec<ActionReceipt>,
    pub cpu_usage_us: u32,
    pub net_usage_words: u32,
    config: ChainConfig,
    pending_block_time: BlockTimestamp,
    deadline: Option<Instant>,
    start: Instant,
    implicit: bool,
    contracts_console: bool,
    sessions_open: bool,
}

impl TransactionContext {
    pub fn new(
        id: Hash,
        config: ChainConfig,
        pending_block_time: BlockTimestamp,
        deadline: Option<Instant>,
        implicit: bool,
        contracts_console: bool,
    ) -> Self {
        Self {
            trace: TransactionTrace::new(id),
            executed: Vec::new(),
            cpu_usage_us: 0,
            net_usage_words: 0,
            config,
            pending_block_time,
            deadline,
            start: Instant::now(),
            implicit,
            contracts_console,
            sessions_open: false,
        }
    }

    // Nested session on both stores; everything this transaction writes
    // stays revertable until squashed into the block
    pub fn start_sessions(&mut self, chain_store: &mut ChainStore, token_db: &mut TokenStore) {
        chain_store.start_undo_session(true);
        token_db.new_nested_savepoint();
        self.sessions_open = true;
    }

    pub fn squash_sessions(
        &mut self,
        chain_store: &mut ChainStore,
        token_db: &mut TokenStore,
    ) -> Result<(), ChainError> {
        self.sessions_open = false;
        chain_store.squash()?;
        token_db.squash()
    }

    pub fn undo_sessions(
        &mut self,
        chain_store: &mut ChainStore,
        token_db: &mut TokenStore,
    ) -> Result<(), ChainError> {
        self.sessions_open = false;
        chain_store.undo()?;
        token_db.rollback_to_latest_savepoint()
    }

    pub fn sessions_open(&self) -> bool {
        self.sessions_open
    }

    // Expiration, TaPoS, signature presence and dedup checks for
    // transactions arriving from the outside
    pub fn init_for_input_trx(
        &mut self,
        chain_store: &mut ChainStore,
        trx: &TransactionMetadata,
    ) -> Result<(), ChainError> {
        let transaction = &trx.trx.trx;
        let now = self.pending_block_time.to_time_point_sec();

        if transaction.expiration < now {
            return Err(ChainError::ExpiredTx {
                id: trx.id.clone(),
                expiration: transaction.expiration,
                now,
            });
        }
        let max_lifetime = self.config.max_transaction_lifetime;
        if transaction.expiration > now.plus_secs(max_lifetime) {
            return Err(ChainError::TxExpTooFar {
                id: trx.id.clone(),
                expiration: transaction.expiration,
                now,
                max_lifetime,
            });
        }

        let summary = chain_store.get_block_summary(transaction.ref_block_num)?;
        if !transaction.verify_reference_block(&summary) {
            return Err(ChainError::InvalidRefBlock { id: trx.id.clone() });
        }

        if trx.trx.signatures.is_empty() {
            return Err(ChainError::TxNoSignatures);
        }

        // Insert into the dedup window; a second arrival of the same id
        // fails here until the expiration evicts the record
        chain_store.insert_transaction(&trx.id, transaction.expiration)?;
        Ok(())
    }

    // Dispatch every action through its registered handler
    pub fn exec(
        &mut self,
        chain_store: &mut ChainStore,
        token_db: &mut TokenStore,
        handlers: &HashMap<Name, ApplyHandler>,
        chain_id: &Hash,
        trx: &TransactionMetadata,
    ) -> Result<(), ChainError> {
        for action in &trx.trx.trx.actions {
            self.check_deadline()?;
            self.dispatch_action(chain_store, token_db, handlers, chain_id, action)?;
        }
        Ok(())
    }

    fn dispatch_action(
        &mut self,
        chain_store: &mut ChainStore,
        token_db: &mut TokenStore,
        handlers: &HashMap<Name, ApplyHandler>,
        chain_id: &Hash,
        action: &Action,
    ) -> Result<(), ChainError> {
        trace!("dispatching {} in {}:{}", action.name, action.domain, action.key);
        let handler = handlers
            .get(&action.name)
            .copied()
            .ok_or(ChainError::UnknownAction(action.name))?;

        let action_start = Instant::now();
        let mut context = ApplyContext {
            token_db,
            action,
            handlers,
            chain_id,
            pending_block_time: self.pending_block_time,
            max_authority_depth: self.config.max_authority_depth,
            max_inline_action_depth: self.config.max_inline_action_depth,
            depth: 0,
            contracts_console: self.contracts_console,
            console: String::new(),
        };
        handler(&mut context)?;
        let console = context.console;

        let mut dynamic = chain_store.get_dynamic_global_property()?;
        dynamic.global_action_sequence += 1;
        chain_store.set_dynamic_global_property(&dynamic)?;

        let receipt = ActionReceipt {
            act_digest: action.hash(),
            global_sequence: dynamic.global_action_sequence,
            recv_sequence: chain_store.next_recv_sequence(&action.domain)?,
        };
        self.executed.push(receipt.clone());
        self.trace.action_traces.push(ActionTrace {
            receipt,
            act: action.clone(),
            elapsed_us: action_start.elapsed().as_micros() as u64,
            console,
        });
        Ok(())
    }

    // Round up resource usage and enforce the per-transaction bound
    pub fn finalize(&mut self, trx: &TransactionMetadata) -> Result<(), ChainError> {
        let net_usage = if self.implicit {
            0
        } else {
            FIXED_NET_OVERHEAD_OF_PACKED_TRX
                + trx.packed_trx.size() as u64
                + self.config.base_per_transaction_net_usage as u64
        };
        if net_usage > self.config.max_transaction_net_usage as u64 {
            return Err(ChainError::TxNetUsageExceeded(
                self.config.max_transaction_net_usage,
            ));
        }
        self.net_usage_words = net_usage.div_ceil(NET_USAGE_WORD_SIZE) as u32;
        self.trace.net_usage = self.net_usage_words as u64 * NET_USAGE_WORD_SIZE;

        self.trace.elapsed_us = self.start.elapsed().as_micros() as u64;
        self.cpu_usage_us = self.trace.elapsed_us.min(u32::MAX as u64) as u32;
        Ok(())
    }

    // Soft wall-clock bound, checked at action boundaries
    pub fn check_deadline(&self) -> Result<(), ChainError> {
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Err(ChainError::Deadline);
            }
        }
        Ok(())
    }
}
