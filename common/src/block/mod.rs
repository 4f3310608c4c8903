mod header;
mod merkle;

use serde::{Deserialize, Serialize};

pub use header::{num_from_id, BlockHeader, HeaderConfirmation, SignedBlockHeader};
pub use merkle::merkle;

use crate::{
    crypto::{hash, Hash},
    serializer::{Reader, ReaderError, Serializer, Writer},
    transaction::{Extension, PackedTransaction},
};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    // Succeeded, no error handler executed
    Executed,
    // Failed, error handler executed
    SoftFail,
    // Failed, error handler failed as well
    HardFail,
    // Scheduled for a future time
    Delayed,
    // Expired before inclusion, cpu/net refunded
    Expired,
}

impl Serializer for TransactionStatus {
    fn write(&self, writer: &mut Writer) {
        let value = match self {
            TransactionStatus::Executed => 0u8,
            TransactionStatus::SoftFail => 1,
            TransactionStatus::HardFail => 2,
            TransactionStatus::Delayed => 3,
            TransactionStatus::Expired => 4,
        };
        writer.write_u8(value);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        match reader.read_u8()? {
            0 => Ok(TransactionStatus::Executed),
            1 => Ok(TransactionStatus::SoftFail),
            2 => Ok(TransactionStatus::HardFail),
            3 => Ok(TransactionStatus::Delayed),
            4 => Ok(TransactionStatus::Expired),
            _ => Err(ReaderError::InvalidValue),
        }
    }

    fn size(&self) -> usize {
        1
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TransactionReceipt {
    pub status: TransactionStatus,
    pub cpu_usage_us: u32,
    pub net_usage_words: u32,
    pub trx: PackedTransaction,
}

impl TransactionReceipt {
    pub fn new(status: TransactionStatus, trx: PackedTransaction) -> Self {
        Self {
            status,
            cpu_usage_us: 0,
            net_usage_words: 0,
            trx,
        }
    }

    // Digest folded into the block's transaction merkle root
    pub fn digest(&self) -> Hash {
        let mut writer = Writer::new();
        self.status.write(&mut writer);
        writer.write_u32(self.cpu_usage_us);
        writer.write_u32(self.net_usage_words);
        self.trx.packed_digest().write(&mut writer);
        hash(writer.as_bytes())
    }
}

impl Serializer for TransactionReceipt {
    fn write(&self, writer: &mut Writer) {
        self.status.write(writer);
        writer.write_u32(self.cpu_usage_us);
        writer.write_u32(self.net_usage_words);
        self.trx.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            status: TransactionStatus::read(reader)?,
            cpu_usage_us: reader.read_u32()?,
            net_usage_words: reader.read_u32()?,
            trx: PackedTransaction::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.status.size() + 4 + 4 + self.trx.size()
    }
}

// Full block as it travels between peers
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SignedBlock {
    pub signed_header: SignedBlockHeader,
    pub transactions: Vec<TransactionReceipt>,
    // Must stay empty on the current protocol version
    pub block_extensions: Vec<Extension>,
}

impl SignedBlock {
    pub fn new(signed_header: SignedBlockHeader) -> Self {
        Self {
            signed_header,
            transactions: Vec::new(),
            block_extensions: Vec::new(),
        }
    }

    pub fn header(&self) -> &BlockHeader {
        &self.signed_header.header
    }

    pub fn id(&self) -> Hash {
        self.signed_header.header.id()
    }

    pub fn block_num(&self) -> u32 {
        self.signed_header.header.block_num()
    }
}

impl Serializer for SignedBlock {
    fn write(&self, writer: &mut Writer) {
        self.signed_header.write(writer);
        self.transactions.write(writer);
        self.block_extensions.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            signed_header: SignedBlockHeader::read(reader)?,
            transactions: Vec::read(reader)?,
            block_extensions: Vec::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.signed_header.size() + self.transactions.size() + self.block_extensions.size()
    }
}
