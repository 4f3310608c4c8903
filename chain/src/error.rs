use sigil_common::{
    config::ConfigError,
    crypto::{CryptoError, Hash},
    name::{Name, Name128, NameError},
    time::TimePointSec,
    token::AuthorityError,
    transaction::PackError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    // Validation errors
    #[error(transparent)]
    Name(#[from] NameError),
    #[error("{name} action in domain {domain} with key {key} authorized failed")]
    UnsatisfiedAuthorization {
        domain: Name128,
        key: Name128,
        name: Name,
    },
    #[error("transaction declares no signatures")]
    TxNoSignatures,
    #[error("transaction requires keys that were not provided")]
    TxMissingSigs,
    #[error(transparent)]
    Pack(#[from] PackError),
    #[error("transaction {id} has expired at {expiration}, pending block time is {now}")]
    ExpiredTx {
        id: Hash,
        expiration: TimePointSec,
        now: TimePointSec,
    },
    #[error("transaction {id} expiration {expiration} is too far in the future, limit is {max_lifetime}s past {now}")]
    TxExpTooFar {
        id: Hash,
        expiration: TimePointSec,
        now: TimePointSec,
        max_lifetime: u32,
    },
    #[error("transaction {id} reference block does not match, is it from a different fork?")]
    InvalidRefBlock { id: Hash },
    #[error("duplicate transaction {0}")]
    TxDuplicate(Hash),
    #[error("could not find block {0}")]
    UnknownBlockNum(u32),
    #[error("could not find block {0}")]
    UnknownBlockId(Hash),
    #[error("authority walk exceeded the maximum depth of {0}")]
    AuthorityDepthExceeded(u16),
    #[error("no handler registered for action {0}")]
    UnknownAction(Name),
    #[error("action {name} is routed at {domain}:{key}, not where its payload points")]
    InvalidActionRouting {
        name: Name,
        domain: Name128,
        key: Name128,
    },
    #[error("inline actions nested deeper than the limit of {0}")]
    InlineActionDepthExceeded(u16),
    #[error("transaction net usage exceeds the per-transaction limit of {0} bytes")]
    TxNetUsageExceeded(u32),

    // Subjective failures, node local, the transaction stays eligible
    #[error("transaction deadline exceeded")]
    Deadline,

    // Consensus failures while applying a block
    #[error("block {num} transaction merkle root does not match: header {expected}, computed {computed}")]
    TransactionMrootMismatch {
        num: u32,
        expected: Hash,
        computed: Hash,
    },
    #[error("block {num} action merkle root does not match: header {expected}, computed {computed}")]
    ActionMrootMismatch {
        num: u32,
        expected: Hash,
        computed: Hash,
    },
    #[error("block {num} is signed with a key that is not the scheduled producer's")]
    WrongBlockSignature { num: u32 },
    #[error("block {id} does not link to any known block")]
    UnlinkableBlock { id: Hash },
    #[error("block {id} carries extensions the current version does not support")]
    UnsupportedExtensions { id: Hash },
    #[error("transaction {id} failed while applying block {num}: {reason}")]
    BlockApplyTrxFailed { num: u32, id: Hash, reason: String },
    #[error("block {0} is already present in the fork database")]
    DuplicateBlock(Hash),
    #[error("block timestamp does not advance past its previous block")]
    BlockNotLater,
    #[error("block declares schedule version {declared}, active schedule is {active}")]
    WrongScheduleVersion { declared: u32, active: u32 },
    #[error("block producer {declared} is not the producer scheduled for the slot")]
    WrongProducer { declared: Name },
    #[error("confirmation for block {0} names a producer outside the active schedule")]
    ConfirmationProducerUnknown(Hash),
    #[error("producer {0} already confirmed this block")]
    DuplicateConfirmation(Name),
    #[error("confirmation signature is invalid")]
    InvalidConfirmationSignature,

    // Controller state machine misuse
    #[error("a pending block is already in progress")]
    PendingBlockExists,
    #[error("no pending block")]
    NoPendingBlock,
    #[error("attempt to pop beyond the last irreversible block")]
    PopBeyondLib,
    #[error("committed block did not become the new head in the fork database")]
    CommittedBlockNotHead,
    #[error("fork switch revert failed, the node state is unrecoverable: {0}")]
    ForkSwitchRevert(Box<ChainError>),

    // Token database domain errors
    #[error("domain {0} already exists")]
    DomainExists(Name128),
    #[error("domain {0} does not exist")]
    DomainNotFound(Name128),
    #[error("token {domain}:{name} already exists")]
    TokenExists { domain: Name128, name: Name128 },
    #[error("token {domain}:{name} does not exist")]
    TokenNotFound { domain: Name128, name: Name128 },
    #[error("group {0} already exists")]
    GroupExists(Name128),
    #[error("group {0} does not exist")]
    GroupNotFound(Name128),
    #[error("account {0} already exists")]
    AccountExists(Name128),
    #[error("account {0} does not exist")]
    AccountNotFound(Name128),
    #[error("account {account} balance is {have}, cannot spend {need}")]
    InsufficientBalance {
        account: Name128,
        need: u64,
        have: u64,
    },
    #[error("delay {0} already exists")]
    DelayExists(Name128),
    #[error("delay {0} does not exist")]
    DelayNotFound(Name128),
    #[error("delay {0} is not in the proposed state")]
    DelayNotProposed(Name128),
    #[error("token owner set cannot be empty")]
    EmptyOwner,
    #[error("group name {action} in the action does not match the definition's {definition}")]
    GroupNameMismatch {
        action: Name128,
        definition: Name128,
    },
    #[error("account {0} balance overflowed")]
    BalanceOverflow(Name128),
    #[error("signature in payload of delay {0} does not belong to its transaction")]
    InvalidDelaySignature(Name128),
    #[error(transparent)]
    Authority(#[from] AuthorityError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Config(#[from] ConfigError),

    // Storage failures, propagate without touching consensus state
    #[error(transparent)]
    Storage(#[from] sled::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Reader(#[from] sigil_common::serializer::ReaderError),
    #[error("block log is corrupted: {0}")]
    BlockLogCorrupted(String),
    #[error("block log append out of order: appending {appending}, head is {head}")]
    BlockLogOutOfOrder { appending: u32, head: u32 },
    #[error("state storage is inconsistent: {0}")]
    StorageInconsistent(String),
}

impl ChainError {
    // Subjective failures depend on this node's clock or load, never on
    // consensus state; the transaction may still succeed in a later block
    pub fn is_subjective(&self) -> bool {
        matches!(self, ChainError::Deadline)
    }
}
