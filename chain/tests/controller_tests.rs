// End-to-end scenarios for the chain controller: genesis, block
// production and application, fork switching and its reversal,
// irreversibility and producer schedule promotion.

use std::{cell::RefCell, collections::HashMap, rc::Rc, sync::Arc};

use sigil_chain::{
    config::Config,
    controller::{BlockStatus, Controller},
    error::ChainError,
    genesis::GenesisState,
    metadata::TransactionMetadata,
    contracts::{
        IssueToken, NewDomain, Transfer, ACTION_ISSUETOKEN, ACTION_NEWDOMAIN, ACTION_TRANSFER,
        DOMAIN_DOMAIN,
    },
};
use sigil_common::{
    block::{HeaderConfirmation, SignedBlock, TransactionReceipt, TransactionStatus},
    crypto::{KeyPair, PublicKey},
    name::Name128,
    serializer::Serializer,
    time::BlockTimestamp,
    token::{Permission, PERMISSION_ISSUE, PERMISSION_MANAGE, PERMISSION_TRANSFER, TOKEN_KEY_ISSUE},
    transaction::{Action, Compression, SignedTransaction, Transaction},
};
use tempdir::TempDir;

// 2020-01-01T00:00:00 UTC
const GENESIS_UNIX_MS: u64 = 1_577_836_800_000;

struct TestNode {
    _dir: TempDir,
    // Signing keys by public key, for schedules with several producers
    signers: HashMap<PublicKey, KeyPair>,
    controller: Controller,
}

impl TestNode {
    fn new(label: &str, genesis_pair: &KeyPair) -> Self {
        let dir = TempDir::new(label).unwrap();
        let genesis = GenesisState::new(
            BlockTimestamp::from_unix_millis(GENESIS_UNIX_MS),
            genesis_pair.public_key().clone(),
        );
        let controller = Controller::new(Config::with_base_dir(dir.path(), genesis)).unwrap();
        let mut signers = HashMap::new();
        signers.insert(genesis_pair.public_key().clone(), genesis_pair.clone());
        Self {
            _dir: dir,
            signers,
            controller,
        }
    }

    fn add_signer(&mut self, pair: &KeyPair) {
        self.signers.insert(pair.public_key().clone(), pair.clone());
    }

    // Produce one block at the next slot carrying the given transactions
    fn produce_block(&mut self, confirm: u16, trxs: &[Arc<TransactionMetadata>]) -> SignedBlock {
        self.produce_block_at(self.controller.head_block_time().next(), confirm, trxs)
    }

    fn produce_block_at(
        &mut self,
        when: BlockTimestamp,
        confirm: u16,
        trxs: &[Arc<TransactionMetadata>],
    ) -> SignedBlock {
        self.controller
            .start_block(when, confirm, BlockStatus::Incomplete)
            .unwrap();
        for trx in trxs {
            let trace = self.controller.push_transaction(trx, None).unwrap();
            assert!(
                trace.except.is_none(),
                "transaction failed while producing: {:?}",
                trace.except
            );
        }
        self.finish_block()
    }

    fn finish_block(&mut self) -> SignedBlock {
        self.controller.finalize_block().unwrap();
        let signing_key = self
            .controller
            .pending_block_state()
            .unwrap()
            .block_signing_key
            .clone();
        let signer = self.signers.get(&signing_key).expect("unknown signer").clone();
        self.controller
            .sign_block(|digest| signer.sign(digest))
            .unwrap();
        self.controller.commit_block().unwrap();
        (*self.controller.head_block_state().block).clone()
    }

    // Build a signed transaction targeting the current chain and head
    fn signed_trx(&self, actions: Vec<Action>, signer: &KeyPair) -> Arc<TransactionMetadata> {
        let head_id = self.controller.head_block_id();
        let expiration = self
            .controller
            .head_block_time()
            .to_time_point_sec()
            .plus_secs(120);
        let mut trx = Transaction::new(expiration, actions);
        trx.set_reference_block(&head_id);
        let mut signed = SignedTransaction::new(trx, Vec::new());
        signed.sign(signer.private_key(), self.controller.get_chain_id());
        Arc::new(TransactionMetadata::from_signed(signed, Compression::None).unwrap())
    }
}

fn newdomain_action(name: &str, creator: &KeyPair) -> Action {
    let name: Name128 = name.parse().unwrap();
    let payload = NewDomain {
        name,
        creator: creator.public_key().clone(),
        issue: Permission::sole_key(PERMISSION_ISSUE, creator.public_key().clone()),
        transfer: Permission::owner(PERMISSION_TRANSFER),
        manage: Permission::sole_key(PERMISSION_MANAGE, creator.public_key().clone()),
    };
    Action::new(ACTION_NEWDOMAIN, DOMAIN_DOMAIN, name, payload.to_bytes())
}

fn issuetoken_action(domain: &str, token: &str, owner: &KeyPair) -> Action {
    let domain: Name128 = domain.parse().unwrap();
    let payload = IssueToken {
        domain,
        names: vec![token.parse().unwrap()],
        owner: vec![owner.public_key().clone()],
    };
    Action::new(ACTION_ISSUETOKEN, domain, TOKEN_KEY_ISSUE, payload.to_bytes())
}

fn transfer_action(domain: &str, token: &str, to: &KeyPair) -> Action {
    let domain: Name128 = domain.parse().unwrap();
    let token: Name128 = token.parse().unwrap();
    let payload = Transfer {
        domain,
        name: token,
        to: vec![to.public_key().clone()],
        memo: "for you".to_string(),
    };
    Action::new(ACTION_TRANSFER, domain, token, payload.to_bytes())
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn watch_irreversible(controller: &mut Controller) -> Rc<RefCell<Vec<u32>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    controller
        .signals
        .irreversible_block
        .connect(move |state| {
            sink.borrow_mut().push(state.block_num());
            Ok(())
        });
    seen
}

#[test]
fn test_genesis_initialization() {
    let pair = KeyPair::random();
    let node = TestNode::new("genesis", &pair);
    let controller = &node.controller;

    assert_eq!(controller.head_block_num(), 1);

    let genesis = GenesisState::new(
        BlockTimestamp::from_unix_millis(GENESIS_UNIX_MS),
        pair.public_key().clone(),
    );
    assert_eq!(*controller.get_chain_id(), genesis.compute_chain_id());

    // The four genesis domains exist and are issued by the initial key
    for name in ["domain", "group", "account", "delay"] {
        let domain = controller
            .token_db()
            .get_domain(&name.parse().unwrap())
            .unwrap();
        assert_eq!(&domain.issuer, pair.public_key());
    }

    // The block log starts with the genesis block itself
    let log_head = controller.block_log().head().unwrap();
    assert_eq!(log_head.id(), controller.head_block_id());
    assert_eq!(controller.chain_state_revision(), 1);
}

#[test]
fn test_linear_block_application() {
    let pair = KeyPair::random();
    let recipient = KeyPair::random();
    let mut producer = TestNode::new("linear-producer", &pair);
    let mut observer = TestNode::new("linear-observer", &pair);

    let irreversible = watch_irreversible(&mut observer.controller);

    let trx1 = producer.signed_trx(vec![newdomain_action("cards", &pair)], &pair);
    let b2 = producer.produce_block(0, &[trx1]);
    let trx2 = producer.signed_trx(vec![issuetoken_action("cards", "ace", &pair)], &pair);
    let b3 = producer.produce_block(0, &[trx2]);
    let trx3 = producer.signed_trx(vec![transfer_action("cards", "ace", &recipient)], &pair);
    let b4 = producer.produce_block(0, &[trx3]);

    for block in [b2, b3, b4] {
        observer
            .controller
            .push_block(block, BlockStatus::Complete)
            .unwrap();
    }

    assert_eq!(
        observer.controller.head_block_id(),
        producer.controller.head_block_id()
    );
    assert_eq!(observer.controller.head_block_num(), 4);
    assert_eq!(observer.controller.chain_state_revision(), 4);

    // The token moved to the recipient on the observer as well
    let token = observer
        .controller
        .token_db()
        .get_token(&"cards".parse().unwrap(), &"ace".parse().unwrap())
        .unwrap();
    assert_eq!(token.owner, vec![recipient.public_key().clone()]);

    // Nothing was confirmed, so nothing became irreversible
    assert!(irreversible.borrow().is_empty());
}

#[test]
fn test_transaction_validation_failures() {
    let pair = KeyPair::random();
    let mut node = TestNode::new("validation", &pair);

    // Duplicate within the dedup window
    let trx = node.signed_trx(vec![newdomain_action("cards", &pair)], &pair);
    node.controller
        .start_block(
            node.controller.head_block_time().next(),
            0,
            BlockStatus::Incomplete,
        )
        .unwrap();
    let first = node.controller.push_transaction(&trx, None).unwrap();
    assert!(first.except.is_none());
    let second = node.controller.push_transaction(&trx, None).unwrap();
    assert!(matches!(&second.except, Some(ChainError::TxDuplicate(_))));
    node.finish_block();

    // A transaction referencing a block id the summary ring does not
    // hold is pinned to some other fork
    let head_id = node.controller.head_block_id();
    let expiration = node
        .controller
        .head_block_time()
        .to_time_point_sec()
        .plus_secs(120);
    let mut raw = Transaction::new(expiration, vec![newdomain_action("dice", &pair)]);
    raw.set_reference_block(&head_id);
    raw.ref_block_prefix ^= 0xffff_ffff;
    let mut signed = SignedTransaction::new(raw, Vec::new());
    signed.sign(pair.private_key(), node.controller.get_chain_id());
    let bad_tapos = Arc::new(TransactionMetadata::from_signed(signed, Compression::None).unwrap());

    node.controller
        .start_block(
            node.controller.head_block_time().next(),
            0,
            BlockStatus::Incomplete,
        )
        .unwrap();
    let trace = node.controller.push_transaction(&bad_tapos, None).unwrap();
    assert!(matches!(&trace.except, Some(ChainError::InvalidRefBlock { .. })));

    // Unauthorized: a stranger cannot issue into someone else's domain
    let stranger = KeyPair::random();
    let unauthorized = node.signed_trx(vec![issuetoken_action("cards", "king", &stranger)], &stranger);
    let trace = node.controller.push_transaction(&unauthorized, None).unwrap();
    assert!(matches!(
        &trace.except,
        Some(ChainError::UnsatisfiedAuthorization { .. })
    ));
    node.controller.abort_block().unwrap();
}

#[test]
fn test_abort_block_returns_transactions() {
    let pair = KeyPair::random();
    let mut node = TestNode::new("abort", &pair);

    let trx = node.signed_trx(vec![newdomain_action("cards", &pair)], &pair);
    node.controller
        .start_block(
            node.controller.head_block_time().next(),
            0,
            BlockStatus::Incomplete,
        )
        .unwrap();
    let trace = node.controller.push_transaction(&trx, None).unwrap();
    assert!(trace.except.is_none());
    node.controller.abort_block().unwrap();

    // The mutation is gone and the transaction is eligible again
    assert!(!node
        .controller
        .token_db()
        .exists_domain(&"cards".parse().unwrap())
        .unwrap());
    let unapplied = node.controller.get_unapplied_transactions();
    assert_eq!(unapplied.len(), 1);
    assert_eq!(unapplied[0].id, trx.id);
    assert_eq!(node.controller.chain_state_revision(), 1);
}

#[test]
fn test_deadline_failure_retains_transaction() {
    let pair = KeyPair::random();
    let mut node = TestNode::new("deadline", &pair);

    // Park the transaction in the unapplied pool first
    let trx = node.signed_trx(vec![newdomain_action("cards", &pair)], &pair);
    node.controller
        .start_block(
            node.controller.head_block_time().next(),
            0,
            BlockStatus::Incomplete,
        )
        .unwrap();
    node.controller.push_transaction(&trx, None).unwrap();
    node.controller.abort_block().unwrap();
    assert_eq!(node.controller.get_unapplied_transactions().len(), 1);

    // A deadline hit is subjective: the transaction stays eligible
    node.controller
        .start_block(
            node.controller.head_block_time().next(),
            0,
            BlockStatus::Incomplete,
        )
        .unwrap();
    let expired = std::time::Instant::now() - std::time::Duration::from_millis(10);
    let trace = node.controller.push_transaction(&trx, Some(expired)).unwrap();
    assert!(matches!(&trace.except, Some(ChainError::Deadline)));
    assert_eq!(node.controller.get_unapplied_transactions().len(), 1);

    // With room to run it executes and leaves the pool
    let trace = node.controller.push_transaction(&trx, None).unwrap();
    assert!(trace.except.is_none());
    assert!(node.controller.get_unapplied_transactions().is_empty());
    node.finish_block();
}

#[test]
fn test_fork_switch() {
    init_logging();
    let pair = KeyPair::random();
    let mut node_a = TestNode::new("fork-a", &pair);
    let mut node_b = TestNode::new("fork-b", &pair);
    let mut subject = TestNode::new("fork-subject", &pair);

    // Chain A: blocks 2, 3, 4; block 2 is the common ancestor
    let shared = node_a.signed_trx(vec![newdomain_action("shared", &pair)], &pair);
    let b2 = node_a.produce_block(0, &[shared]);
    let trx_a3 = node_a.signed_trx(vec![newdomain_action("only-a3", &pair)], &pair);
    let a3 = node_a.produce_block(0, &[trx_a3.clone()]);
    let trx_a4 = node_a.signed_trx(vec![newdomain_action("only-a4", &pair)], &pair);
    let a4 = node_a.produce_block(0, &[trx_a4.clone()]);

    // Chain B forks after block 2 and confirms as it goes, so its
    // irreversibility outruns chain A's
    node_b
        .controller
        .push_block(b2.clone(), BlockStatus::Complete)
        .unwrap();
    let trx_b3 = node_b.signed_trx(vec![newdomain_action("only-b3", &pair)], &pair);
    let b3 = node_b.produce_block_at(
        node_b.controller.head_block_time().next().next(),
        1,
        &[trx_b3],
    );
    let trx_b4 = node_b.signed_trx(vec![newdomain_action("only-b4", &pair)], &pair);
    let b4 = node_b.produce_block(1, &[trx_b4]);
    let b5 = node_b.produce_block(1, &[]);

    // The subject follows chain A first
    for block in [b2, a3, a4] {
        subject
            .controller
            .push_block(block, BlockStatus::Complete)
            .unwrap();
    }
    assert_eq!(subject.controller.head_block_num(), 4);

    let irreversible = watch_irreversible(&mut subject.controller);

    // Chain B arrives; its first block already carries enough
    // irreversibility to win the fork choice
    subject
        .controller
        .push_block(b3, BlockStatus::Complete)
        .unwrap();
    subject
        .controller
        .push_block(b4, BlockStatus::Complete)
        .unwrap();
    subject
        .controller
        .push_block(b5.clone(), BlockStatus::Complete)
        .unwrap();

    assert_eq!(subject.controller.head_block_id(), b5.id());
    assert_eq!(subject.controller.head_block_num(), 5);
    assert_eq!(subject.controller.chain_state_revision(), 5);

    // Both popped chain-A blocks returned their transactions
    let unapplied: Vec<_> = subject
        .controller
        .get_unapplied_transactions()
        .iter()
        .map(|t| t.signed_id.clone())
        .collect();
    assert_eq!(unapplied.len(), 2);
    assert!(unapplied.contains(&trx_a3.signed_id));
    assert!(unapplied.contains(&trx_a4.signed_id));

    // Chain B's state won, chain A's branch state is gone
    let token_db = subject.controller.token_db();
    assert!(token_db.exists_domain(&"shared".parse().unwrap()).unwrap());
    assert!(token_db.exists_domain(&"only-b3".parse().unwrap()).unwrap());
    assert!(token_db.exists_domain(&"only-b4".parse().unwrap()).unwrap());
    assert!(!token_db.exists_domain(&"only-a3".parse().unwrap()).unwrap());
    assert!(!token_db.exists_domain(&"only-a4".parse().unwrap()).unwrap());

    // Block 2 became irreversible along the way
    assert!(irreversible.borrow().contains(&2));
}

#[test]
fn test_fork_switch_failure_restores_previous_head() {
    init_logging();
    let pair = KeyPair::random();
    let mut node_a = TestNode::new("revert-a", &pair);
    let mut node_b = TestNode::new("revert-b", &pair);
    let mut subject = TestNode::new("revert-subject", &pair);

    // Chain A: blocks 2..6, applied by the subject
    let shared = node_a.signed_trx(vec![newdomain_action("shared", &pair)], &pair);
    let b2 = node_a.produce_block(0, &[shared]);
    let trx_a3 = node_a.signed_trx(vec![newdomain_action("only-a3", &pair)], &pair);
    let a3 = node_a.produce_block(0, &[trx_a3]);
    let a4 = node_a.produce_block(0, &[]);
    let a5 = node_a.produce_block(0, &[]);
    let a6 = node_a.produce_block(0, &[]);

    // Chain B: three valid-looking blocks after block 2; the last one
    // smuggles in a transaction that cannot execute
    node_b
        .controller
        .push_block(b2.clone(), BlockStatus::Complete)
        .unwrap();
    let trx_b3 = node_b.signed_trx(vec![newdomain_action("only-b3", &pair)], &pair);
    let b3 = node_b.produce_block_at(
        node_b.controller.head_block_time().next().next(),
        0,
        &[trx_b3],
    );
    let b4 = node_b.produce_block(0, &[]);
    let mut b5 = node_b.produce_block(0, &[]);

    // The payload tries to recreate a genesis domain, which must fail
    let bad = node_b.signed_trx(vec![newdomain_action("domain", &pair)], &pair);
    b5.transactions.push(TransactionReceipt::new(
        TransactionStatus::Executed,
        bad.packed_trx.clone(),
    ));

    for block in [b2, a3, a4, a5, a6] {
        subject
            .controller
            .push_block(block, BlockStatus::Complete)
            .unwrap();
    }
    let head_before = subject.controller.head_block_id();
    assert_eq!(subject.controller.head_block_num(), 6);

    // Shorter than chain A, so these merely sit in the fork database
    let b5_id = b5.id();
    for block in [b3, b4, b5] {
        subject
            .controller
            .push_block(block, BlockStatus::Complete)
            .unwrap();
    }
    assert_eq!(subject.controller.head_block_id(), head_before);

    // A two-thirds confirmation makes the bad block the fork head and
    // forces the switch
    let b5_state = subject.controller.fetch_block_state_by_id(&b5_id).unwrap();
    let confirmation = HeaderConfirmation {
        block_id: b5_id.clone(),
        producer: "sigil".parse().unwrap(),
        producer_signature: pair.sign(&b5_state.header_state.sig_digest()),
    };
    let result = subject.controller.push_confirmation(confirmation);
    assert!(matches!(
        result,
        Err(ChainError::BlockApplyTrxFailed { num: 5, .. })
    ));

    // The failed switch restored the pre-switch world exactly
    assert_eq!(subject.controller.head_block_id(), head_before);
    assert_eq!(subject.controller.head_block_num(), 6);
    assert_eq!(subject.controller.chain_state_revision(), 6);
    assert!(subject.controller.get_unapplied_transactions().is_empty());

    let token_db = subject.controller.token_db();
    assert!(token_db.exists_domain(&"shared".parse().unwrap()).unwrap());
    assert!(token_db.exists_domain(&"only-a3".parse().unwrap()).unwrap());
    assert!(!token_db.exists_domain(&"only-b3".parse().unwrap()).unwrap());

    // The bad block fell out of the fork database
    assert!(subject.controller.fetch_block_state_by_id(&b5_id).is_none());
}

#[test]
fn test_irreversibility_advance() {
    let pair = KeyPair::random();
    let mut node = TestNode::new("irreversible", &pair);
    let irreversible = watch_irreversible(&mut node.controller);

    // Each block confirms its parent, so irreversibility trails the
    // head by one block
    for _ in 0..5 {
        node.produce_block(1, &[]);
    }

    assert_eq!(node.controller.head_block_num(), 6);
    assert_eq!(node.controller.last_irreversible_block_num(), 5);

    // Emitted once per block, in ascending order
    assert_eq!(*irreversible.borrow(), vec![2, 3, 4, 5]);

    // The block log followed irreversibility
    assert_eq!(node.controller.block_log().head_block_num(), Some(5));
    assert_eq!(
        node.controller.last_irreversible_block_id().unwrap(),
        node.controller.get_block_id_for_num(5).unwrap()
    );
    assert_eq!(node.controller.chain_state_revision(), 6);
}

#[test]
fn test_producer_schedule_promotion() {
    let alpha = KeyPair::random();
    let beta = KeyPair::random();
    let mut node = TestNode::new("schedule", &alpha);
    node.add_signer(&beta);

    // Propose a two-producer schedule inside block 2
    node.controller
        .start_block(
            node.controller.head_block_time().next(),
            1,
            BlockStatus::Incomplete,
        )
        .unwrap();
    let version = node
        .controller
        .set_proposed_producers(vec![
            sigil_common::producer::ProducerKey {
                producer_name: "sigil".parse().unwrap(),
                block_signing_key: alpha.public_key().clone(),
            },
            sigil_common::producer::ProducerKey {
                producer_name: "tessa".parse().unwrap(),
                block_signing_key: beta.public_key().clone(),
            },
        ])
        .unwrap();
    assert_eq!(version, Some(1));
    node.finish_block();
    assert!(node.controller.proposed_producers().unwrap().is_some());

    // Block 3 confirms block 2, making the proposal block irreversible,
    // so block 3 itself carries the schedule as pending
    let b3 = node.produce_block(1, &[]);
    assert!(b3.header().new_producers.is_some());
    assert_eq!(node.controller.pending_producers().version, 1);
    assert!(node.controller.proposed_producers().unwrap().is_none());

    // Once the pending block is irreversible the schedule activates
    node.produce_block(1, &[]);
    assert_eq!(node.controller.active_producers().version, 1);
    assert_eq!(node.controller.active_producers().producers.len(), 2);
    assert!(node.controller.pending_producers().producers.is_empty());

    // Production continues under the new schedule, whichever producer
    // owns the slot
    node.produce_block(1, &[]);
    node.produce_block(1, &[]);
    assert_eq!(node.controller.head_block_num(), 6);
}

#[test]
fn test_restart_replays_to_identical_state() {
    let pair = KeyPair::random();
    let recipient = KeyPair::random();
    let dir = TempDir::new("restart").unwrap();
    let genesis = GenesisState::new(
        BlockTimestamp::from_unix_millis(GENESIS_UNIX_MS),
        pair.public_key().clone(),
    );

    let head_id;
    let lib_num;
    {
        let mut node = TestNode {
            _dir: TempDir::new("restart-scratch").unwrap(),
            signers: HashMap::from([(pair.public_key().clone(), pair.clone())]),
            controller: Controller::new(Config::with_base_dir(dir.path(), genesis.clone()))
                .unwrap(),
        };

        let trx = node.signed_trx(vec![newdomain_action("cards", &pair)], &pair);
        node.produce_block(1, &[trx]);
        let trx = node.signed_trx(vec![issuetoken_action("cards", "ace", &pair)], &pair);
        node.produce_block(1, &[trx]);
        let trx = node.signed_trx(vec![transfer_action("cards", "ace", &recipient)], &pair);
        node.produce_block(1, &[trx]);

        head_id = node.controller.head_block_id();
        lib_num = node.controller.last_irreversible_block_num();
        node.controller.shutdown().unwrap();
    }

    let controller = Controller::new(Config::with_base_dir(dir.path(), genesis)).unwrap();
    assert_eq!(controller.head_block_id(), head_id);
    assert_eq!(controller.last_irreversible_block_num(), lib_num);
    assert_eq!(
        controller.chain_state_revision(),
        controller.head_block_num() as u64
    );

    let token = controller
        .token_db()
        .get_token(&"cards".parse().unwrap(), &"ace".parse().unwrap())
        .unwrap();
    assert_eq!(token.owner, vec![recipient.public_key().clone()]);
}
