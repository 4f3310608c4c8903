use serde::{Deserialize, Serialize};

use crate::{
    crypto::{hash, Hash, PrivateKey, PublicKey, Signature},
    name::Name,
    producer::ProducerSchedule,
    serializer::{Reader, ReaderError, Serializer, Writer},
    time::BlockTimestamp,
    transaction::Extension,
};

// Block number from a block id: the first four bytes, big-endian
pub fn num_from_id(id: &Hash) -> u32 {
    let bytes = id.as_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub timestamp: BlockTimestamp,
    pub producer: Name,
    // How many previous blocks this one confirms on the producer's behalf
    pub confirmed: u16,
    pub previous: Hash,
    pub transaction_mroot: Hash,
    pub action_mroot: Hash,
    pub schedule_version: u32,
    pub new_producers: Option<ProducerSchedule>,
    pub header_extensions: Vec<Extension>,
}

impl BlockHeader {
    // Digest of the serialized header
    pub fn digest(&self) -> Hash {
        hash(&self.to_bytes())
    }

    pub fn block_num(&self) -> u32 {
        num_from_id(&self.previous) + 1
    }

    // The id is the header digest with the block number spliced into
    // the first four bytes, big-endian
    pub fn id(&self) -> Hash {
        let mut bytes = self.digest().to_bytes();
        bytes[0..4].copy_from_slice(&self.block_num().to_be_bytes());
        Hash::new(bytes)
    }
}

impl Serializer for BlockHeader {
    fn write(&self, writer: &mut Writer) {
        self.timestamp.write(writer);
        self.producer.write(writer);
        writer.write_u16(self.confirmed);
        self.previous.write(writer);
        self.transaction_mroot.write(writer);
        self.action_mroot.write(writer);
        writer.write_u32(self.schedule_version);
        self.new_producers.write(writer);
        self.header_extensions.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            timestamp: BlockTimestamp::read(reader)?,
            producer: Name::read(reader)?,
            confirmed: reader.read_u16()?,
            previous: Hash::read(reader)?,
            transaction_mroot: Hash::read(reader)?,
            action_mroot: Hash::read(reader)?,
            schedule_version: reader.read_u32()?,
            new_producers: Option::read(reader)?,
            header_extensions: Vec::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.timestamp.size()
            + self.producer.size()
            + 2
            + self.previous.size()
            + self.transaction_mroot.size()
            + self.action_mroot.size()
            + 4
            + self.new_producers.size()
            + self.header_extensions.size()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SignedBlockHeader {
    pub header: BlockHeader,
    pub producer_signature: Signature,
}

impl SignedBlockHeader {
    // Digest the producer actually signs: header digest mixed with the
    // pending schedule hash so a producer cannot equivocate on it
    pub fn sig_digest(header: &BlockHeader, pending_schedule_hash: &Hash) -> Hash {
        let mut writer = Writer::with_capacity(64);
        header.digest().write(&mut writer);
        pending_schedule_hash.write(&mut writer);
        hash(writer.as_bytes())
    }

    pub fn sign(
        header: &BlockHeader,
        pending_schedule_hash: &Hash,
        key: &PrivateKey,
    ) -> Signature {
        key.sign(&Self::sig_digest(header, pending_schedule_hash))
    }

    // Recover the key that signed this block
    pub fn signee(&self, pending_schedule_hash: &Hash) -> Option<PublicKey> {
        self.producer_signature
            .recover(&Self::sig_digest(&self.header, pending_schedule_hash))
            .ok()
    }
}

impl Serializer for SignedBlockHeader {
    fn write(&self, writer: &mut Writer) {
        self.header.write(writer);
        self.producer_signature.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            header: BlockHeader::read(reader)?,
            producer_signature: Signature::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.header.size() + self.producer_signature.size()
    }
}

// A producer's standalone vote that a block it saw is correct,
// feeding BFT irreversibility
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct HeaderConfirmation {
    pub block_id: Hash,
    pub producer: Name,
    pub producer_signature: Signature,
}

impl HeaderConfirmation {
    pub fn digest(&self) -> Hash {
        let mut writer = Writer::with_capacity(40);
        self.block_id.write(&mut writer);
        self.producer.write(&mut writer);
        hash(writer.as_bytes())
    }
}

impl Serializer for HeaderConfirmation {
    fn write(&self, writer: &mut Writer) {
        self.block_id.write(writer);
        self.producer.write(writer);
        self.producer_signature.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            block_id: Hash::read(reader)?,
            producer: Name::read(reader)?,
            producer_signature: Signature::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.block_id.size() + self.producer.size() + self.producer_signature.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_num_follows_previous() {
        let mut header = BlockHeader::default();
        assert_eq!(header.block_num(), 1);

        let mut previous = [0u8; 32];
        previous[0..4].copy_from_slice(&41u32.to_be_bytes());
        header.previous = Hash::new(previous);
        assert_eq!(header.block_num(), 42);
    }

    #[test]
    fn test_id_embeds_block_num() {
        let header = BlockHeader::default();
        let id = header.id();
        assert_eq!(num_from_id(&id), 1);
        // Everything after the spliced number comes from the digest
        assert_eq!(id.as_bytes()[4..], header.digest().as_bytes()[4..]);
    }

    #[test]
    fn test_header_round_trip() {
        let mut header = BlockHeader::default();
        header.confirmed = 3;
        header.schedule_version = 7;
        let decoded = BlockHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(decoded, header);
    }
}
