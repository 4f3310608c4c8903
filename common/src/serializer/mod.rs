mod reader;
mod writer;

pub use reader::{Reader, ReaderError};
pub use writer::Writer;

// How many bytes a varuint32 takes on the wire
pub fn varuint32_size(value: u32) -> usize {
    let mut size = 1;
    let mut value = value >> 7;
    while value != 0 {
        size += 1;
        value >>= 7;
    }
    size
}

pub trait Serializer {
    fn write(&self, writer: &mut Writer);

    fn read(reader: &mut Reader) -> Result<Self, ReaderError>
    where
        Self: Sized;

    fn size(&self) -> usize;

    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(self.size());
        self.write(&mut writer);
        writer.bytes()
    }

    // Deserialize from a complete byte slice, rejecting trailing bytes
    fn from_bytes(bytes: &[u8]) -> Result<Self, ReaderError>
    where
        Self: Sized,
    {
        let mut reader = Reader::new(bytes);
        let value = Self::read(&mut reader)?;
        if reader.size() != 0 {
            return Err(ReaderError::DirtyBytes(reader.size()));
        }
        Ok(value)
    }

    fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

impl Serializer for bool {
    fn write(&self, writer: &mut Writer) {
        writer.write_bool(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_bool()
    }

    fn size(&self) -> usize {
        1
    }
}

impl Serializer for u8 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u8(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u8()
    }

    fn size(&self) -> usize {
        1
    }
}

impl Serializer for u16 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u16(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u16()
    }

    fn size(&self) -> usize {
        2
    }
}

impl Serializer for u32 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u32()
    }

    fn size(&self) -> usize {
        4
    }
}

impl Serializer for u64 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u64()
    }

    fn size(&self) -> usize {
        8
    }
}

impl Serializer for String {
    fn write(&self, writer: &mut Writer) {
        writer.write_string(self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_string()
    }

    fn size(&self) -> usize {
        varuint32_size(self.len() as u32) + self.len()
    }
}

// Optionals are a presence byte followed by the value
impl<T: Serializer> Serializer for Option<T> {
    fn write(&self, writer: &mut Writer) {
        match self {
            Some(value) => {
                writer.write_bool(true);
                value.write(writer);
            }
            None => writer.write_bool(false),
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        if reader.read_bool()? {
            Ok(Some(T::read(reader)?))
        } else {
            Ok(None)
        }
    }

    fn size(&self) -> usize {
        match self {
            Some(value) => 1 + value.size(),
            None => 1,
        }
    }
}

// Vectors are a varuint32 count followed by the elements
impl<T: Serializer> Serializer for Vec<T> {
    fn write(&self, writer: &mut Writer) {
        writer.write_varuint32(self.len() as u32);
        for item in self {
            item.write(writer);
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let count = reader.read_varuint32()? as usize;
        // Bound the pre-allocation, the count is attacker controlled
        let mut items = Vec::with_capacity(count.min(512));
        for _ in 0..count {
            items.push(T::read(reader)?);
        }
        Ok(items)
    }

    fn size(&self) -> usize {
        varuint32_size(self.len() as u32) + self.iter().map(Serializer::size).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varuint32_round_trip() {
        for value in [0u32, 1, 127, 128, 300, 16383, 16384, u32::MAX] {
            let mut writer = Writer::new();
            writer.write_varuint32(value);
            assert_eq!(writer.len(), varuint32_size(value));

            let mut reader = Reader::new(writer.as_bytes());
            assert_eq!(reader.read_varuint32().unwrap(), value);
            assert_eq!(reader.size(), 0);
        }
    }

    #[test]
    fn test_from_bytes_rejects_trailing_bytes() {
        let mut bytes = 42u64.to_bytes();
        bytes.push(0);
        assert!(matches!(u64::from_bytes(&bytes), Err(ReaderError::DirtyBytes(1))));
    }

    #[test]
    fn test_vec_round_trip() {
        let values: Vec<u32> = vec![1, 2, 3, 0xdeadbeef];
        let decoded = Vec::<u32>::from_bytes(&values.to_bytes()).unwrap();
        assert_eq!(values, decoded);
    }

    #[test]
    fn test_option_round_trip() {
        let value: Option<u16> = Some(7);
        assert_eq!(Option::<u16>::from_bytes(&value.to_bytes()).unwrap(), value);
        let none: Option<u16> = None;
        assert_eq!(Option::<u16>::from_bytes(&none.to_bytes()).unwrap(), none);
    }
}
