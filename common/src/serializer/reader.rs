use thiserror::Error;

use crate::crypto::{Hash, HASH_SIZE};

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("Not enough bytes left in reader")]
    InvalidSize,
    #[error("Invalid value in reader")]
    InvalidValue,
    #[error("Invalid string bytes")]
    InvalidString,
    #[error("Varint is too big")]
    VarintTooBig,
    #[error("All bytes were not consumed: {0} left")]
    DirtyBytes(usize),
}

// Reader over a borrowed byte slice
// All integers are read little-endian
pub struct Reader<'a> {
    bytes: &'a [u8],
    total: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, total: 0 }
    }

    // How many bytes are left to read
    pub fn size(&self) -> usize {
        self.bytes.len() - self.total
    }

    // How many bytes were consumed so far
    pub fn total_read(&self) -> usize {
        self.total
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, ReaderError> {
        Ok(self.read_bytes_ref(n)?.to_vec())
    }

    pub fn read_bytes_ref(&mut self, n: usize) -> Result<&'a [u8], ReaderError> {
        if n > self.size() {
            return Err(ReaderError::InvalidSize);
        }
        let bytes = &self.bytes[self.total..self.total + n];
        self.total += n;
        Ok(bytes)
    }

    pub fn read_bytes_32(&mut self) -> Result<[u8; 32], ReaderError> {
        let bytes = self.read_bytes_ref(32)?;
        let mut array = [0u8; 32];
        array.copy_from_slice(bytes);
        Ok(array)
    }

    pub fn read_bool(&mut self) -> Result<bool, ReaderError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ReaderError::InvalidValue),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, ReaderError> {
        let bytes = self.read_bytes_ref(1)?;
        Ok(bytes[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ReaderError> {
        let bytes = self.read_bytes_ref(2)?;
        Ok(u16::from_le_bytes(bytes.try_into().map_err(|_| ReaderError::InvalidSize)?))
    }

    pub fn read_u32(&mut self) -> Result<u32, ReaderError> {
        let bytes = self.read_bytes_ref(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().map_err(|_| ReaderError::InvalidSize)?))
    }

    pub fn read_u64(&mut self) -> Result<u64, ReaderError> {
        let bytes = self.read_bytes_ref(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().map_err(|_| ReaderError::InvalidSize)?))
    }

    pub fn read_u128(&mut self) -> Result<u128, ReaderError> {
        let bytes = self.read_bytes_ref(16)?;
        Ok(u128::from_le_bytes(bytes.try_into().map_err(|_| ReaderError::InvalidSize)?))
    }

    pub fn read_hash(&mut self) -> Result<Hash, ReaderError> {
        let bytes = self.read_bytes_ref(HASH_SIZE)?;
        let mut array = [0u8; HASH_SIZE];
        array.copy_from_slice(bytes);
        Ok(Hash::new(array))
    }

    // Variable-length u32, 7 bits per byte, low bits first
    pub fn read_varuint32(&mut self) -> Result<u32, ReaderError> {
        let mut value: u64 = 0;
        let mut shift = 0;
        loop {
            if shift >= 35 {
                return Err(ReaderError::VarintTooBig);
            }
            let byte = self.read_u8()?;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        u32::try_from(value).map_err(|_| ReaderError::VarintTooBig)
    }

    pub fn read_string_with_size(&mut self, size: usize) -> Result<String, ReaderError> {
        let bytes = self.read_bytes(size)?;
        String::from_utf8(bytes).map_err(|_| ReaderError::InvalidString)
    }

    pub fn read_string(&mut self) -> Result<String, ReaderError> {
        let size = self.read_varuint32()? as usize;
        self.read_string_with_size(size)
    }
}
