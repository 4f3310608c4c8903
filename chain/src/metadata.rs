// Memoized per-transaction state kept while a transaction floats
// between the unapplied pool, pending blocks and the fork database.

use std::{
    collections::BTreeSet,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, Ordering},
        OnceLock,
    },
};

use lru::LruCache;
use sigil_common::{
    crypto::{Hash, PublicKey, Signature},
    transaction::{Compression, PackError, PackedTransaction, SignedTransaction},
};

use crate::error::ChainError;

// Bounded cache of key recoveries; a hit skips EC recovery entirely
pub const RECOVERY_CACHE_SIZE: usize = 1000;

pub struct RecoveryCache {
    cache: LruCache<Signature, (Hash, PublicKey)>,
}

impl RecoveryCache {
    pub fn new() -> Self {
        Self {
            cache: LruCache::new(
                NonZeroUsize::new(RECOVERY_CACHE_SIZE).expect("cache size is non-zero"),
            ),
        }
    }

    // Cached key for this signature, valid only for the same transaction
    fn get(&mut self, signature: &Signature, trx_id: &Hash) -> Option<PublicKey> {
        match self.cache.get(signature) {
            Some((id, key)) if id == trx_id => Some(key.clone()),
            _ => None,
        }
    }

    fn put(&mut self, signature: Signature, trx_id: Hash, key: PublicKey) {
        self.cache.put(signature, (trx_id, key));
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }
}

impl Default for RecoveryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct TransactionMetadata {
    pub id: Hash,
    pub signed_id: Hash,
    pub trx: SignedTransaction,
    pub packed_trx: PackedTransaction,
    recovered_keys: OnceLock<BTreeSet<PublicKey>>,
    accepted: AtomicBool,
}

impl TransactionMetadata {
    pub fn from_signed(
        trx: SignedTransaction,
        compression: Compression,
    ) -> Result<Self, ChainError> {
        let packed_trx = PackedTransaction::from_signed(&trx, compression).map_err(ChainError::Pack)?;
        Ok(Self {
            id: trx.id(),
            signed_id: trx.signed_id(),
            trx,
            packed_trx,
            recovered_keys: OnceLock::new(),
            accepted: AtomicBool::new(false),
        })
    }

    pub fn from_packed(packed_trx: PackedTransaction) -> Result<Self, ChainError> {
        let trx = packed_trx.get_signed_transaction().map_err(ChainError::Pack)?;
        Ok(Self {
            id: trx.id(),
            signed_id: trx.signed_id(),
            trx,
            packed_trx,
            recovered_keys: OnceLock::new(),
            accepted: AtomicBool::new(false),
        })
    }

    pub fn accepted(&self) -> bool {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn mark_accepted(&self) {
        self.accepted.store(true, Ordering::Relaxed);
    }

    // Recover the signer keys, memoized on this metadata and backed by
    // the controller's bounded recovery cache
    pub fn recover_keys(
        &self,
        chain_id: &Hash,
        cache: &mut RecoveryCache,
    ) -> Result<&BTreeSet<PublicKey>, ChainError> {
        if self.recovered_keys.get().is_none() {
            let digest = self.trx.trx.sig_digest(chain_id);
            let mut keys = BTreeSet::new();
            for signature in &self.trx.signatures {
                let key = match cache.get(signature, &self.id) {
                    Some(key) => key,
                    None => {
                        let key = signature
                            .recover(&digest)
                            .map_err(|_| ChainError::Pack(PackError::Recovery))?;
                        cache.put(signature.clone(), self.id.clone(), key.clone());
                        key
                    }
                };
                if !keys.insert(key.clone()) {
                    return Err(ChainError::Pack(PackError::DuplicateSignature(key)));
                }
            }
            let _ = self.recovered_keys.set(keys);
        }
        Ok(self.recovered_keys.get().expect("keys were just recovered"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigil_common::{
        crypto::{hash, KeyPair},
        time::TimePointSec,
        transaction::{Action, Transaction},
    };

    fn signed_trx(pair: &KeyPair, chain_id: &Hash) -> SignedTransaction {
        let action = Action::new(
            "transfer".parse().unwrap(),
            "cards".parse().unwrap(),
            "queen".parse().unwrap(),
            vec![],
        );
        let mut trx =
            SignedTransaction::new(Transaction::new(TimePointSec::new(500), vec![action]), vec![]);
        trx.sign(pair.private_key(), chain_id);
        trx
    }

    #[test]
    fn test_metadata_ids() {
        let pair = KeyPair::random();
        let chain_id = hash(b"chain");
        let trx = signed_trx(&pair, &chain_id);
        let metadata = TransactionMetadata::from_signed(trx.clone(), Compression::None).unwrap();
        assert_eq!(metadata.id, trx.id());
        assert_eq!(metadata.signed_id, trx.signed_id());
        assert_ne!(metadata.id, metadata.signed_id);
    }

    #[test]
    fn test_recovery_uses_cache() {
        let pair = KeyPair::random();
        let chain_id = hash(b"chain");
        let mut cache = RecoveryCache::new();

        let first =
            TransactionMetadata::from_signed(signed_trx(&pair, &chain_id), Compression::None)
                .unwrap();
        let keys = first.recover_keys(&chain_id, &mut cache).unwrap();
        assert!(keys.contains(pair.public_key()));
        assert_eq!(cache.len(), 1);

        // Second pass is memoized, the cache stays as it was
        first.recover_keys(&chain_id, &mut cache).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_entry_bound_to_trx_id() {
        let pair = KeyPair::random();
        let chain_id = hash(b"chain");
        let mut cache = RecoveryCache::new();

        let metadata =
            TransactionMetadata::from_signed(signed_trx(&pair, &chain_id), Compression::None)
                .unwrap();
        metadata.recover_keys(&chain_id, &mut cache).unwrap();

        // The same signature must not satisfy a lookup for another id
        let signature = metadata.trx.signatures[0].clone();
        assert!(cache.get(&signature, &hash(b"other")).is_none());
        assert!(cache.get(&signature, &metadata.id).is_some());
    }
}
