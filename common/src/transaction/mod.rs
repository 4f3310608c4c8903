use std::{
    collections::BTreeSet,
    io::{Read, Write},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::MAX_DECOMPRESSED_TRX_SIZE,
    crypto::{hash, Hash, Hashable, PrivateKey, PublicKey, Signature},
    name::{Name, Name128},
    serializer::{Reader, ReaderError, Serializer, Writer},
    time::TimePointSec,
};

#[derive(Debug, Error)]
pub enum PackError {
    #[error("exceeded maximum decompressed transaction size")]
    DecompressionLimit,
    #[error("transaction decompression failed")]
    Decompression,
    #[error("transaction compression failed")]
    Compression,
    #[error("unknown transaction compression algorithm {0}")]
    UnknownCompression(u8),
    #[error(transparent)]
    Unpack(#[from] ReaderError),
    #[error("transaction includes more than one signature signed using the same key: {0}")]
    DuplicateSignature(PublicKey),
    #[error("signature recovery failed")]
    Recovery,
}

// Reserved extension slot, unused by the current protocol version
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Extension {
    pub kind: u16,
    pub data: Vec<u8>,
}

impl Serializer for Extension {
    fn write(&self, writer: &mut Writer) {
        writer.write_u16(self.kind);
        self.data.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            kind: reader.read_u16()?,
            data: Vec::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        2 + self.data.size()
    }
}

// A single state mutation, routed by name and authorized against
// the (domain, key) pair it targets
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Action {
    pub name: Name,
    pub domain: Name128,
    pub key: Name128,
    pub data: Vec<u8>,
}

impl Action {
    pub fn new(name: Name, domain: Name128, key: Name128, data: Vec<u8>) -> Self {
        Self { name, domain, key, data }
    }
}

impl Serializer for Action {
    fn write(&self, writer: &mut Writer) {
        self.name.write(writer);
        self.domain.write(writer);
        self.key.write(writer);
        self.data.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            name: Name::read(reader)?,
            domain: Name128::read(reader)?,
            key: Name128::read(reader)?,
            data: Vec::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.name.size() + self.domain.size() + self.key.size() + self.data.size()
    }
}

impl Hashable for Action {}

// Transaction to be sent over the network
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    // Past this point in time the transaction can no longer be included
    pub expiration: TimePointSec,
    // TaPoS reference: low 16 bits of a recent block number
    pub ref_block_num: u16,
    // TaPoS reference: bytes 8..12 of that block's id
    pub ref_block_prefix: u32,
    pub header_extensions: Vec<Extension>,
    pub actions: Vec<Action>,
}

impl Transaction {
    pub fn new(expiration: TimePointSec, actions: Vec<Action>) -> Self {
        Self {
            expiration,
            ref_block_num: 0,
            ref_block_prefix: 0,
            header_extensions: Vec::new(),
            actions,
        }
    }

    // The transaction id is the digest of the canonical serialization,
    // signatures excluded
    pub fn id(&self) -> Hash {
        self.hash()
    }

    // Digest that gets signed, bound to one chain by its id
    pub fn sig_digest(&self, chain_id: &Hash) -> Hash {
        let mut writer = Writer::with_capacity(chain_id.size() + self.size());
        chain_id.write(&mut writer);
        self.write(&mut writer);
        hash(writer.as_bytes())
    }

    pub fn set_reference_block(&mut self, reference_block: &Hash) {
        let bytes = reference_block.as_bytes();
        self.ref_block_num = u16::from_be_bytes([bytes[2], bytes[3]]);
        self.ref_block_prefix = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    }

    pub fn verify_reference_block(&self, reference_block: &Hash) -> bool {
        let bytes = reference_block.as_bytes();
        self.ref_block_num == u16::from_be_bytes([bytes[2], bytes[3]])
            && self.ref_block_prefix
                == u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]])
    }
}

impl Serializer for Transaction {
    fn write(&self, writer: &mut Writer) {
        self.expiration.write(writer);
        writer.write_u16(self.ref_block_num);
        writer.write_u32(self.ref_block_prefix);
        self.header_extensions.write(writer);
        self.actions.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            expiration: TimePointSec::read(reader)?,
            ref_block_num: reader.read_u16()?,
            ref_block_prefix: reader.read_u32()?,
            header_extensions: Vec::read(reader)?,
            actions: Vec::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.expiration.size()
            + 2
            + 4
            + self.header_extensions.size()
            + self.actions.size()
    }
}

impl Hashable for Transaction {}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SignedTransaction {
    pub trx: Transaction,
    pub signatures: Vec<Signature>,
}

impl SignedTransaction {
    pub fn new(trx: Transaction, signatures: Vec<Signature>) -> Self {
        Self { trx, signatures }
    }

    pub fn id(&self) -> Hash {
        self.trx.id()
    }

    // Digest over the whole signed transaction, signatures included
    pub fn signed_id(&self) -> Hash {
        self.hash()
    }

    pub fn sign(&mut self, key: &PrivateKey, chain_id: &Hash) -> &Signature {
        self.signatures.push(key.sign(&self.trx.sig_digest(chain_id)));
        self.signatures.last().expect("signature was just pushed")
    }

    // Recover all signer keys; duplicate keys are rejected unless allowed
    pub fn get_signature_keys(
        &self,
        chain_id: &Hash,
        allow_duplicate_keys: bool,
    ) -> Result<BTreeSet<PublicKey>, PackError> {
        let digest = self.trx.sig_digest(chain_id);
        let mut keys = BTreeSet::new();
        for signature in &self.signatures {
            let key = signature.recover(&digest).map_err(|_| PackError::Recovery)?;
            if !keys.insert(key.clone()) && !allow_duplicate_keys {
                return Err(PackError::DuplicateSignature(key));
            }
        }
        Ok(keys)
    }
}

impl Serializer for SignedTransaction {
    fn write(&self, writer: &mut Writer) {
        self.trx.write(writer);
        self.signatures.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            trx: Transaction::read(reader)?,
            signatures: Vec::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.trx.size() + self.signatures.size()
    }
}

impl Hashable for SignedTransaction {}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    None,
    Zlib,
}

impl Serializer for Compression {
    fn write(&self, writer: &mut Writer) {
        let value = match self {
            Compression::None => 0u8,
            Compression::Zlib => 1u8,
        };
        writer.write_u8(value);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        match reader.read_u8()? {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Zlib),
            _ => Err(ReaderError::InvalidValue),
        }
    }

    fn size(&self) -> usize {
        1
    }
}

fn zlib_compress(data: &[u8]) -> Result<Vec<u8>, PackError> {
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::best());
    encoder.write_all(data).map_err(|_| PackError::Compression)?;
    encoder.finish().map_err(|_| PackError::Compression)
}

// Bounded decompression, zip bomb protection
fn zlib_decompress(data: &[u8]) -> Result<Vec<u8>, PackError> {
    let decoder = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();
    let read = decoder
        .take(MAX_DECOMPRESSED_TRX_SIZE as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|_| PackError::Decompression)?;
    if read > MAX_DECOMPRESSED_TRX_SIZE {
        return Err(PackError::DecompressionLimit);
    }
    Ok(out)
}

// The form a transaction travels in: canonical transaction bytes,
// optionally zlib compressed, next to its detached signatures
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PackedTransaction {
    pub signatures: Vec<Signature>,
    pub compression: Compression,
    pub packed_trx: Vec<u8>,
}

impl PackedTransaction {
    pub fn from_signed(
        trx: &SignedTransaction,
        compression: Compression,
    ) -> Result<Self, PackError> {
        let raw = trx.trx.to_bytes();
        let packed_trx = match compression {
            Compression::None => raw,
            Compression::Zlib => zlib_compress(&raw)?,
        };
        Ok(Self {
            signatures: trx.signatures.clone(),
            compression,
            packed_trx,
        })
    }

    pub fn get_raw_transaction(&self) -> Result<Vec<u8>, PackError> {
        match self.compression {
            Compression::None => Ok(self.packed_trx.clone()),
            Compression::Zlib => zlib_decompress(&self.packed_trx),
        }
    }

    pub fn get_transaction(&self) -> Result<Transaction, PackError> {
        let raw = self.get_raw_transaction()?;
        Ok(Transaction::from_bytes(&raw)?)
    }

    pub fn get_signed_transaction(&self) -> Result<SignedTransaction, PackError> {
        Ok(SignedTransaction::new(self.get_transaction()?, self.signatures.clone()))
    }

    pub fn id(&self) -> Result<Hash, PackError> {
        Ok(self.get_transaction()?.id())
    }

    pub fn expiration(&self) -> Result<TimePointSec, PackError> {
        Ok(self.get_transaction()?.expiration)
    }

    // Digest used when this packed transaction appears in a receipt
    pub fn packed_digest(&self) -> Hash {
        let prunable = hash(&self.signatures.to_bytes());

        let mut writer = Writer::new();
        self.compression.write(&mut writer);
        self.packed_trx.write(&mut writer);
        prunable.write(&mut writer);
        hash(writer.as_bytes())
    }
}

impl Serializer for PackedTransaction {
    fn write(&self, writer: &mut Writer) {
        self.signatures.write(writer);
        self.compression.write(writer);
        self.packed_trx.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            signatures: Vec::read(reader)?,
            compression: Compression::read(reader)?,
            packed_trx: Vec::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.signatures.size() + self.compression.size() + self.packed_trx.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn sample_transaction() -> Transaction {
        let action = Action::new(
            "transfer".parse().unwrap(),
            "cards".parse().unwrap(),
            "ace-of-spades".parse().unwrap(),
            vec![1, 2, 3, 4],
        );
        let mut trx = Transaction::new(TimePointSec::new(1_000_000), vec![action]);
        trx.ref_block_num = 0x1234;
        trx.ref_block_prefix = 0xdeadbeef;
        trx
    }

    #[test]
    fn test_pack_round_trip_both_compressions() {
        let pair = KeyPair::random();
        let chain_id = hash(b"chain");
        let mut signed = SignedTransaction::new(sample_transaction(), Vec::new());
        signed.sign(pair.private_key(), &chain_id);

        for compression in [Compression::None, Compression::Zlib] {
            let packed = PackedTransaction::from_signed(&signed, compression).unwrap();
            let unpacked = packed.get_signed_transaction().unwrap();
            assert_eq!(unpacked, signed);
            assert_eq!(packed.id().unwrap(), signed.id());

            // And the wire form itself survives
            let decoded = PackedTransaction::from_bytes(&packed.to_bytes()).unwrap();
            assert_eq!(decoded, packed);
        }
    }

    #[test]
    fn test_signature_keys_recovered() {
        let pair = KeyPair::random();
        let chain_id = hash(b"chain");
        let mut signed = SignedTransaction::new(sample_transaction(), Vec::new());
        signed.sign(pair.private_key(), &chain_id);

        let keys = signed.get_signature_keys(&chain_id, false).unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(pair.public_key()));
    }

    #[test]
    fn test_duplicate_signature_rejected() {
        let pair = KeyPair::random();
        let chain_id = hash(b"chain");
        let mut signed = SignedTransaction::new(sample_transaction(), Vec::new());
        signed.sign(pair.private_key(), &chain_id);
        signed.sign(pair.private_key(), &chain_id);

        assert!(matches!(
            signed.get_signature_keys(&chain_id, false),
            Err(PackError::DuplicateSignature(_))
        ));
        assert!(signed.get_signature_keys(&chain_id, true).is_ok());
    }

    #[test]
    fn test_reference_block_math() {
        let mut id_bytes = [0u8; 32];
        // Block number lives in the first four big-endian bytes
        id_bytes[0..4].copy_from_slice(&0x00012345u32.to_be_bytes());
        id_bytes[8..12].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);
        let id = Hash::new(id_bytes);

        let mut trx = sample_transaction();
        trx.set_reference_block(&id);
        assert_eq!(trx.ref_block_num, 0x2345);
        assert_eq!(trx.ref_block_prefix, u32::from_le_bytes([0xaa, 0xbb, 0xcc, 0xdd]));
        assert!(trx.verify_reference_block(&id));

        let other = Hash::new([7u8; 32]);
        assert!(!trx.verify_reference_block(&other));
    }

    #[test]
    fn test_decompression_limit() {
        // A tiny zlib payload that inflates past the 1 MiB bound
        let huge = vec![0u8; MAX_DECOMPRESSED_TRX_SIZE + 1];
        let compressed = zlib_compress(&huge).unwrap();
        assert!(matches!(
            zlib_decompress(&compressed),
            Err(PackError::DecompressionLimit)
        ));
    }

    #[test]
    fn test_id_stable_across_signatures() {
        let pair = KeyPair::random();
        let chain_id = hash(b"chain");
        let unsigned = SignedTransaction::new(sample_transaction(), Vec::new());
        let mut signed = unsigned.clone();
        signed.sign(pair.private_key(), &chain_id);

        assert_eq!(unsigned.id(), signed.id());
        assert_ne!(unsigned.signed_id(), signed.signed_id());
    }
}
