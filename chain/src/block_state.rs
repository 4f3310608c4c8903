// Consensus state derived from a block header: which schedule is
// active, which is waiting to activate, and how far irreversibility has
// advanced along this branch. Every block state is derived from its
// parent's.

use std::{collections::BTreeMap, sync::Arc};

use log::trace;
use sigil_common::{
    block::{BlockHeader, HeaderConfirmation, SignedBlock, SignedBlockHeader},
    config::PRODUCER_REPETITIONS,
    crypto::{Hash, Hashable, PublicKey, Signature},
    name::Name,
    producer::{ProducerKey, ProducerSchedule},
    serializer::{Reader, ReaderError, Serializer, Writer},
    time::BlockTimestamp,
};

use crate::{error::ChainError, metadata::TransactionMetadata};

// Confirmation slots tracked per branch before the oldest are assumed
const MAXIMUM_TRACKED_CONFIRMATIONS: usize = 1024;

#[derive(Clone, Debug)]
pub struct BlockHeaderState {
    pub id: Hash,
    pub block_num: u32,
    pub header: BlockHeader,
    pub producer_signature: Signature,

    pub active_schedule: ProducerSchedule,
    pub pending_schedule: ProducerSchedule,
    pub pending_schedule_hash: Hash,
    // Block in which the pending schedule was set; it activates once
    // that block is irreversible
    pub pending_schedule_lib_num: u32,

    pub dpos_irreversible_blocknum: u32,
    pub bft_irreversible_blocknum: u32,

    pub producer_to_last_produced: BTreeMap<Name, u32>,
    pub block_signing_key: PublicKey,
    // Outstanding confirmations required per recent ancestor, oldest first,
    // ending with this block's own slot
    pub confirm_count: Vec<u8>,
    pub confirmations: Vec<HeaderConfirmation>,
}

impl BlockHeaderState {
    // Root state for a fresh chain
    pub fn genesis(
        timestamp: BlockTimestamp,
        initial_schedule: ProducerSchedule,
        chain_id: Hash,
    ) -> Self {
        let mut header = BlockHeader::default();
        header.timestamp = timestamp;
        header.action_mroot = chain_id;

        let block_signing_key = initial_schedule.producers[0].block_signing_key.clone();
        let pending_schedule_hash = initial_schedule.hash();
        Self {
            id: header.id(),
            block_num: header.block_num(),
            header,
            producer_signature: Signature::zero(),
            active_schedule: initial_schedule.clone(),
            pending_schedule: initial_schedule,
            pending_schedule_hash,
            pending_schedule_lib_num: 0,
            dpos_irreversible_blocknum: 0,
            bft_irreversible_blocknum: 0,
            producer_to_last_produced: BTreeMap::new(),
            block_signing_key,
            confirm_count: Vec::new(),
            confirmations: Vec::new(),
        }
    }

    pub fn get_scheduled_producer(&self, when: BlockTimestamp) -> &ProducerKey {
        let producers = self.active_schedule.producers.len() as u32;
        let mut index = when.slot() % (producers * PRODUCER_REPETITIONS);
        index /= PRODUCER_REPETITIONS;
        &self.active_schedule.producers[index as usize]
    }

    // Digest the producer signs for this block
    pub fn sig_digest(&self) -> Hash {
        SignedBlockHeader::sig_digest(&self.header, &self.pending_schedule_hash)
    }

    // Derive the successor state for a block produced at `when`
    pub fn generate_next(&self, when: BlockTimestamp) -> Result<BlockHeaderState, ChainError> {
        if when <= self.header.timestamp {
            return Err(ChainError::BlockNotLater);
        }

        let mut result = self.clone();
        result.header = BlockHeader::default();
        result.header.timestamp = when;
        result.header.previous = self.id.clone();
        result.header.schedule_version = self.active_schedule.version;

        let producer = self.get_scheduled_producer(when).clone();
        result.header.producer = producer.producer_name;
        result.block_signing_key = producer.block_signing_key;
        result.producer_signature = Signature::zero();

        result.block_num = self.block_num + 1;
        result
            .producer_to_last_produced
            .insert(producer.producer_name, result.block_num);

        result.confirmations = Vec::new();

        // Grow the confirmation slots; the previous active schedule is the
        // one whose producers confirm this block
        let required_confs = (self.active_schedule.producers.len() as u32 * 2 / 3 + 1) as u8;
        if result.confirm_count.len() >= MAXIMUM_TRACKED_CONFIRMATIONS {
            result.confirm_count.remove(0);
        }
        result.confirm_count.push(required_confs);

        result.id = result.header.id();
        Ok(result)
    }

    // Count this block's vote of confidence in its `num_prev_blocks`
    // closest ancestors; a fully confirmed ancestor advances dpos
    // irreversibility to its number
    pub fn set_confirmed(&mut self, num_prev_blocks: u16) {
        self.header.confirmed = num_prev_blocks;

        if self.confirm_count.len() < 2 {
            return;
        }
        // Skip this block's own slot, walk backwards over ancestors
        let mut i = self.confirm_count.len() - 2;
        let mut blocks_to_confirm = num_prev_blocks as u32;
        loop {
            if blocks_to_confirm == 0 {
                return;
            }
            self.confirm_count[i] = self.confirm_count[i].saturating_sub(1);
            if self.confirm_count[i] == 0 {
                let confirmed_num = self.block_num - (self.confirm_count.len() - 1 - i) as u32;
                trace!("block {} becomes dpos irreversible", confirmed_num);
                self.dpos_irreversible_blocknum = confirmed_num;
                self.confirm_count.drain(..=i);
                return;
            }
            if i == 0 {
                return;
            }
            i -= 1;
            blocks_to_confirm -= 1;
        }
    }

    // Promote pending to active once the block that set it is irreversible
    pub fn maybe_promote_pending(&mut self) -> bool {
        if self.pending_schedule.producers.is_empty()
            || self.dpos_irreversible_blocknum < self.pending_schedule_lib_num
        {
            return false;
        }

        self.active_schedule = std::mem::take(&mut self.pending_schedule);

        // Producers that survive the schedule change keep their history,
        // new ones start at the current irreversible block
        let mut new_last_produced = BTreeMap::new();
        for producer in &self.active_schedule.producers {
            let last = self
                .producer_to_last_produced
                .get(&producer.producer_name)
                .copied()
                .unwrap_or(self.dpos_irreversible_blocknum);
            new_last_produced.insert(producer.producer_name, last);
        }
        self.producer_to_last_produced = new_last_produced;
        true
    }

    pub fn set_new_producers(&mut self, schedule: ProducerSchedule) -> Result<(), ChainError> {
        if schedule.version != self.active_schedule.version + 1 {
            return Err(ChainError::WrongScheduleVersion {
                declared: schedule.version,
                active: self.active_schedule.version,
            });
        }
        if !self.pending_schedule.producers.is_empty() {
            return Err(ChainError::StorageInconsistent(
                "cannot set new pending producers until the last pending schedule is confirmed"
                    .into(),
            ));
        }
        self.pending_schedule_hash = schedule.hash();
        self.pending_schedule = schedule.clone();
        self.pending_schedule_lib_num = self.block_num;
        self.header.new_producers = Some(schedule);
        // Setting new producers changes the header, and with it the id
        self.id = self.header.id();
        Ok(())
    }

    // Validate a received header against the state generated from it
    pub fn next(&self, h: &SignedBlockHeader, trust: bool) -> Result<BlockHeaderState, ChainError> {
        if h.header.previous != self.id {
            return Err(ChainError::UnlinkableBlock { id: h.header.id() });
        }
        if !h.header.header_extensions.is_empty() {
            return Err(ChainError::UnsupportedExtensions { id: h.header.id() });
        }
        let mut result = self.generate_next(h.header.timestamp)?;

        if result.header.producer != h.header.producer {
            return Err(ChainError::WrongProducer {
                declared: h.header.producer,
            });
        }
        if result.header.schedule_version != h.header.schedule_version {
            return Err(ChainError::WrongScheduleVersion {
                declared: h.header.schedule_version,
                active: result.header.schedule_version,
            });
        }

        result.set_confirmed(h.header.confirmed);
        let was_pending_promoted = result.maybe_promote_pending();

        if let Some(new_producers) = &h.header.new_producers {
            if was_pending_promoted {
                return Err(ChainError::StorageInconsistent(
                    "cannot set pending producers in the block that promoted the last ones".into(),
                ));
            }
            result.set_new_producers(new_producers.clone())?;
        }

        result.header.action_mroot = h.header.action_mroot.clone();
        result.header.transaction_mroot = h.header.transaction_mroot.clone();
        result.header.header_extensions = h.header.header_extensions.clone();
        result.producer_signature = h.producer_signature.clone();
        result.id = result.header.id();

        if !trust {
            result.verify_signee()?;
        }
        Ok(result)
    }

    // Assign the producer signature over this state's signing digest
    pub fn sign<F>(&mut self, signer: F) -> Result<(), ChainError>
    where
        F: FnOnce(&Hash) -> Signature,
    {
        self.producer_signature = signer(&self.sig_digest());
        self.verify_signee()
    }

    pub fn verify_signee(&self) -> Result<(), ChainError> {
        let signee = self
            .producer_signature
            .recover(&self.sig_digest())
            .map_err(|_| ChainError::WrongBlockSignature { num: self.block_num })?;
        if signee != self.block_signing_key {
            return Err(ChainError::WrongBlockSignature { num: self.block_num });
        }
        Ok(())
    }

    // Attach a producer's standalone confirmation of this block
    pub fn add_confirmation(&mut self, confirmation: &HeaderConfirmation) -> Result<(), ChainError> {
        for existing in &self.confirmations {
            if existing.producer == confirmation.producer {
                return Err(ChainError::DuplicateConfirmation(confirmation.producer));
            }
        }

        let key = self
            .active_schedule
            .get_producer_key(confirmation.producer)
            .ok_or(ChainError::ConfirmationProducerUnknown(self.id.clone()))?;
        let signer = confirmation
            .producer_signature
            .recover(&self.sig_digest())
            .map_err(|_| ChainError::InvalidConfirmationSignature)?;
        if signer != *key {
            return Err(ChainError::InvalidConfirmationSignature);
        }

        self.confirmations.push(confirmation.clone());
        Ok(())
    }
}

impl Serializer for BlockHeaderState {
    fn write(&self, writer: &mut Writer) {
        self.id.write(writer);
        writer.write_u32(self.block_num);
        self.header.write(writer);
        self.producer_signature.write(writer);
        self.active_schedule.write(writer);
        self.pending_schedule.write(writer);
        self.pending_schedule_hash.write(writer);
        writer.write_u32(self.pending_schedule_lib_num);
        writer.write_u32(self.dpos_irreversible_blocknum);
        writer.write_u32(self.bft_irreversible_blocknum);
        writer.write_varuint32(self.producer_to_last_produced.len() as u32);
        for (name, num) in &self.producer_to_last_produced {
            name.write(writer);
            writer.write_u32(*num);
        }
        self.block_signing_key.write(writer);
        self.confirm_count.write(writer);
        self.confirmations.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let id = Hash::read(reader)?;
        let block_num = reader.read_u32()?;
        let header = BlockHeader::read(reader)?;
        let producer_signature = Signature::read(reader)?;
        let active_schedule = ProducerSchedule::read(reader)?;
        let pending_schedule = ProducerSchedule::read(reader)?;
        let pending_schedule_hash = Hash::read(reader)?;
        let pending_schedule_lib_num = reader.read_u32()?;
        let dpos_irreversible_blocknum = reader.read_u32()?;
        let bft_irreversible_blocknum = reader.read_u32()?;
        let count = reader.read_varuint32()?;
        let mut producer_to_last_produced = BTreeMap::new();
        for _ in 0..count {
            let name = Name::read(reader)?;
            let num = reader.read_u32()?;
            producer_to_last_produced.insert(name, num);
        }
        Ok(Self {
            id,
            block_num,
            header,
            producer_signature,
            active_schedule,
            pending_schedule,
            pending_schedule_hash,
            pending_schedule_lib_num,
            dpos_irreversible_blocknum,
            bft_irreversible_blocknum,
            producer_to_last_produced,
            block_signing_key: PublicKey::read(reader)?,
            confirm_count: Vec::read(reader)?,
            confirmations: Vec::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.len()
    }
}

// A block header state together with the block itself and per-node
// bookkeeping the fork database maintains
#[derive(Clone, Debug)]
pub struct BlockState {
    pub header_state: BlockHeaderState,
    pub block: Arc<SignedBlock>,
    pub validated: bool,
    pub in_current_chain: bool,
    // Metadata for the transactions carried by this block, kept so a
    // popped block can return them to the unapplied pool
    pub trxs: Vec<Arc<TransactionMetadata>>,
}

impl BlockState {
    pub fn new(header_state: BlockHeaderState, block: Arc<SignedBlock>) -> Self {
        Self {
            header_state,
            block,
            validated: false,
            in_current_chain: false,
            trxs: Vec::new(),
        }
    }

    pub fn id(&self) -> &Hash {
        &self.header_state.id
    }

    pub fn block_num(&self) -> u32 {
        self.header_state.block_num
    }

    pub fn previous(&self) -> &Hash {
        &self.header_state.header.previous
    }
}
