use serde::{Deserialize, Serialize};

use crate::{
    crypto::{Hashable, PublicKey},
    name::Name,
    serializer::{Reader, ReaderError, Serializer, Writer},
};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ProducerKey {
    pub producer_name: Name,
    pub block_signing_key: PublicKey,
}

impl Serializer for ProducerKey {
    fn write(&self, writer: &mut Writer) {
        self.producer_name.write(writer);
        self.block_signing_key.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            producer_name: Name::read(reader)?,
            block_signing_key: PublicKey::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.producer_name.size() + self.block_signing_key.size()
    }
}

// Ordered set of block producers, promoted in two steps:
// proposed -> pending -> active
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct ProducerSchedule {
    pub version: u32,
    pub producers: Vec<ProducerKey>,
}

impl ProducerSchedule {
    pub fn new(version: u32, producers: Vec<ProducerKey>) -> Self {
        Self { version, producers }
    }

    pub fn get_producer_key(&self, name: Name) -> Option<&PublicKey> {
        self.producers
            .iter()
            .find(|p| p.producer_name == name)
            .map(|p| &p.block_signing_key)
    }
}

impl Serializer for ProducerSchedule {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.version);
        self.producers.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            version: reader.read_u32()?,
            producers: Vec::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        4 + self.producers.size()
    }
}

impl Hashable for ProducerSchedule {}
