use std::{
    fmt::{Display, Error as FmtError, Formatter},
    hash::Hasher,
    str::FromStr,
};

use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    Message, SECP256K1,
};
use serde::de::Error as SerdeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::hash::Hash;
use crate::serializer::{Reader, ReaderError, Serializer, Writer};

pub const PUBLIC_KEY_SIZE: usize = 33; // compressed secp256k1 point
pub const SIGNATURE_SIZE: usize = 65; // recovery id + compact signature

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid public key bytes")]
    InvalidPublicKey,
    #[error("Invalid signature bytes")]
    InvalidSignature,
    #[error("Public key recovery failed")]
    RecoveryFailed,
}

// Compressed secp256k1 public key
#[derive(Eq, PartialEq, PartialOrd, Ord, Clone, Debug)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; PUBLIC_KEY_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        // Reject bytes that do not decode to a curve point
        secp256k1::PublicKey::from_slice(&array).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(PublicKey(array))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for PublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidPublicKey)?;
        PublicKey::from_bytes(&bytes)
    }
}

impl Serializer for PublicKey {
    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(&self.0);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let bytes = reader.read_bytes_ref(PUBLIC_KEY_SIZE)?;
        PublicKey::from_bytes(bytes).map_err(|_| ReaderError::InvalidValue)
    }

    fn size(&self) -> usize {
        PUBLIC_KEY_SIZE
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'a> Deserialize<'a> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'a>,
    {
        let hex = String::deserialize(deserializer)?;
        let bytes = hex::decode(hex).map_err(SerdeError::custom)?;
        PublicKey::from_bytes(&bytes).map_err(SerdeError::custom)
    }
}

// Recoverable ECDSA signature: one recovery byte then the 64-byte compact
// form. Bytes are not validated until recovery is attempted, so wire
// parsing stays cheap and placeholder signatures (genesis) stay
// representable.
#[derive(Eq, PartialEq, PartialOrd, Ord, Clone, Debug)]
pub struct Signature([u8; SIGNATURE_SIZE]);

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; SIGNATURE_SIZE] =
            bytes.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Signature(array))
    }

    // Placeholder used where no producer has signed, e.g. the genesis block
    pub const fn zero() -> Self {
        Signature([0u8; SIGNATURE_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    // Recover the signing public key from the digest that was signed
    pub fn recover(&self, digest: &Hash) -> Result<PublicKey, CryptoError> {
        let signature = Signature::decode(&self.0)?;
        let message = Message::from_digest(*digest.as_bytes());
        let point = SECP256K1
            .recover_ecdsa(&message, &signature)
            .map_err(|_| CryptoError::RecoveryFailed)?;
        Ok(PublicKey(point.serialize()))
    }

    // Verify that this signature over the digest recovers to the given key
    pub fn verify(&self, digest: &Hash, key: &PublicKey) -> bool {
        match self.recover(digest) {
            Ok(recovered) => recovered == *key,
            Err(_) => false,
        }
    }

    fn decode(bytes: &[u8; SIGNATURE_SIZE]) -> Result<RecoverableSignature, CryptoError> {
        let recovery_id = RecoveryId::from_i32(bytes[0] as i32)
            .map_err(|_| CryptoError::InvalidSignature)?;
        RecoverableSignature::from_compact(&bytes[1..], recovery_id)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

impl std::hash::Hash for Signature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}", self.to_hex())
    }
}

impl Serializer for Signature {
    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(&self.0);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let bytes = reader.read_bytes_ref(SIGNATURE_SIZE)?;
        let mut array = [0u8; SIGNATURE_SIZE];
        array.copy_from_slice(bytes);
        Ok(Signature(array))
    }

    fn size(&self) -> usize {
        SIGNATURE_SIZE
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'a> Deserialize<'a> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'a>,
    {
        let hex = String::deserialize(deserializer)?;
        let bytes = hex::decode(hex).map_err(SerdeError::custom)?;
        Signature::from_bytes(&bytes).map_err(SerdeError::custom)
    }
}

// Signing key, kept out of any wire format
#[derive(Clone, Debug)]
pub struct PrivateKey(secp256k1::SecretKey);

impl PrivateKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        secp256k1::SecretKey::from_slice(bytes)
            .map(PrivateKey)
            .map_err(|_| CryptoError::InvalidSignature)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.public_key(SECP256K1).serialize())
    }

    pub fn sign(&self, digest: &Hash) -> Signature {
        let message = Message::from_digest(*digest.as_bytes());
        let signature = SECP256K1.sign_ecdsa_recoverable(&message, &self.0);
        let (recovery_id, compact) = signature.serialize_compact();
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes[0] = recovery_id.to_i32() as u8;
        bytes[1..].copy_from_slice(&compact);
        Signature(bytes)
    }
}

// Key pair helper, mostly for tests and tools
#[derive(Clone, Debug)]
pub struct KeyPair {
    private: PrivateKey,
    public: PublicKey,
}

impl KeyPair {
    pub fn new(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }

    pub fn random() -> Self {
        let secret = secp256k1::SecretKey::new(&mut secp256k1::rand::thread_rng());
        Self::new(PrivateKey(secret))
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private
    }

    pub fn sign(&self, digest: &Hash) -> Signature {
        self.private.sign(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::hash;

    #[test]
    fn test_sign_and_recover() {
        let pair = KeyPair::random();
        let digest = hash(b"payload");
        let signature = pair.sign(&digest);

        let recovered = signature.recover(&digest).unwrap();
        assert_eq!(&recovered, pair.public_key());
        assert!(signature.verify(&digest, pair.public_key()));
    }

    #[test]
    fn test_recover_wrong_digest() {
        let pair = KeyPair::random();
        let signature = pair.sign(&hash(b"payload"));

        // Recovers to some key, but not this one
        assert!(!signature.verify(&hash(b"other"), pair.public_key()));
    }

    #[test]
    fn test_signature_round_trip() {
        let pair = KeyPair::random();
        let signature = pair.sign(&hash(b"payload"));
        let decoded = Signature::from_bytes(signature.as_bytes()).unwrap();
        assert_eq!(signature, decoded);
    }
}
