mod hash;
mod keys;

pub use hash::{hash, hash_pair, Hash, Hashable, HASH_SIZE};
pub use keys::{
    CryptoError, KeyPair, PrivateKey, PublicKey, Signature, PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
};
