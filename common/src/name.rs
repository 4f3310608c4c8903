use std::{
    fmt::{Display, Error as FmtError, Formatter},
    str::FromStr,
};

use serde::de::Error as SerdeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::serializer::{Reader, ReaderError, Serializer, Writer};

// Short identifier: up to 13 chars of [a-z1-5.], packed into a u64.
// 5 bits per char, 4 bits for the last one, '.' encodes as 0 and is
// trimmed from the right on display.
const NAME_MAX_LEN: usize = 13;
const NAME_CHARMAP: &[u8; 32] = b".12345abcdefghijklmnopqrstuvwxyz";

// Long identifier: up to 21 chars of [0-9a-zA-Z.-], packed into a u128.
// 6 bits per char above a 2-bit length tag.
const NAME128_MAX_LEN: usize = 21;
const NAME128_CHARMAP: &[u8; 64] = b".-0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Error)]
pub enum NameError {
    #[error("name is longer than {1} characters: {0}")]
    TooLong(String, usize),
    #[error("name not properly normalized: {0} (normalized: {1})")]
    NotNormalized(String, String),
}

const fn char_to_symbol(c: u8) -> u64 {
    if c >= b'a' && c <= b'z' {
        return (c - b'a') as u64 + 6;
    }
    if c >= b'1' && c <= b'5' {
        return (c - b'1') as u64 + 1;
    }
    0
}

const fn char_to_symbol128(c: u8) -> u128 {
    if c >= b'a' && c <= b'z' {
        return (c - b'a') as u128 + 12;
    }
    if c >= b'A' && c <= b'Z' {
        return (c - b'A') as u128 + 38;
    }
    if c >= b'0' && c <= b'9' {
        return (c - b'0') as u128 + 2;
    }
    if c == b'-' {
        return 1;
    }
    0
}

const fn string_to_name(bytes: &[u8]) -> u64 {
    let mut value: u64 = 0;
    let mut i = 0;
    while i < bytes.len() && i < NAME_MAX_LEN {
        if i < 12 {
            value |= (char_to_symbol(bytes[i]) & 0x1f) << (64 - 5 * (i + 1));
        } else {
            value |= char_to_symbol(bytes[i]) & 0x0f;
        }
        i += 1;
    }
    value
}

const fn string_to_name128(bytes: &[u8]) -> u128 {
    let mut value: u128 = 0;
    let mut i = 0;
    while i < bytes.len() && i < NAME128_MAX_LEN {
        value |= (char_to_symbol128(bytes[i]) & 0x3f) << (2 + 6 * (20 - i));
        i += 1;
    }
    // Low tag records the length bucket
    let tag: u128 = if bytes.len() <= 5 {
        0
    } else if bytes.len() <= 10 {
        1
    } else if bytes.len() <= 15 {
        2
    } else {
        3
    };
    value | tag
}

#[derive(Eq, PartialEq, PartialOrd, Ord, Clone, Copy, Debug, Hash, Default)]
pub struct Name(u64);

impl Name {
    pub const fn from_raw(value: u64) -> Self {
        Name(value)
    }

    // Compile-time constructor for well-known names; the caller is
    // responsible for passing an already normalized string
    pub const fn constant(s: &'static str) -> Self {
        Name(string_to_name(s.as_bytes()))
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl Display for Name {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        let mut buffer = [b'.'; NAME_MAX_LEN];
        let mut tmp = self.0;
        for i in 0..NAME_MAX_LEN {
            let mask = if i == 0 { 0x0f } else { 0x1f };
            buffer[12 - i] = NAME_CHARMAP[(tmp & mask) as usize];
            tmp >>= if i == 0 { 4 } else { 5 };
        }
        let end = buffer.iter().rposition(|c| *c != b'.').map_or(0, |p| p + 1);
        // The buffer only ever holds charset bytes
        f.write_str(std::str::from_utf8(&buffer[..end]).expect("name charmap is ascii"))
    }
}

impl FromStr for Name {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > NAME_MAX_LEN {
            return Err(NameError::TooLong(s.to_string(), NAME_MAX_LEN));
        }
        let name = Name(string_to_name(s.as_bytes()));
        let normalized = name.to_string();
        if normalized != s {
            return Err(NameError::NotNormalized(s.to_string(), normalized));
        }
        Ok(name)
    }
}

impl Serializer for Name {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.0);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Name(reader.read_u64()?))
    }

    fn size(&self) -> usize {
        8
    }
}

impl Serialize for Name {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'a> Deserialize<'a> for Name {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'a>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(SerdeError::custom)
    }
}

#[derive(Eq, PartialEq, PartialOrd, Ord, Clone, Copy, Debug, Hash, Default)]
pub struct Name128(u128);

impl Name128 {
    pub const fn from_raw(value: u128) -> Self {
        Name128(value)
    }

    // Compile-time constructor for well-known names; the caller is
    // responsible for passing an already normalized string
    pub const fn constant(s: &'static str) -> Self {
        Name128(string_to_name128(s.as_bytes()))
    }

    pub const fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 >> 2 == 0
    }
}

impl Display for Name128 {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        let mut buffer = [b'.'; NAME128_MAX_LEN];
        let mut tmp = self.0 >> 2;
        for i in 0..NAME128_MAX_LEN {
            buffer[20 - i] = NAME128_CHARMAP[(tmp & 0x3f) as usize];
            tmp >>= 6;
        }
        let end = buffer.iter().rposition(|c| *c != b'.').map_or(0, |p| p + 1);
        f.write_str(std::str::from_utf8(&buffer[..end]).expect("name charmap is ascii"))
    }
}

impl FromStr for Name128 {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > NAME128_MAX_LEN {
            return Err(NameError::TooLong(s.to_string(), NAME128_MAX_LEN));
        }
        let name = Name128(string_to_name128(s.as_bytes()));
        let normalized = name.to_string();
        if normalized != s {
            return Err(NameError::NotNormalized(s.to_string(), normalized));
        }
        Ok(name)
    }
}

impl Serializer for Name128 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u128(self.0);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Name128(reader.read_u128()?))
    }

    fn size(&self) -> usize {
        16
    }
}

impl Serialize for Name128 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'a> Deserialize<'a> for Name128 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'a>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(SerdeError::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        for s in ["", "a", "sigil", "newdomain", "issuetoken", "a.b.c", "zzzzzzzzzzzzj", "12345"] {
            let name: Name = s.parse().unwrap();
            assert_eq!(name.to_string(), s, "round trip failed for {:?}", s);
        }
    }

    #[test]
    fn test_name_rejects_bad_input() {
        // Out of charset
        assert!("Hello".parse::<Name>().is_err());
        assert!("a_b".parse::<Name>().is_err());
        assert!("a6".parse::<Name>().is_err());
        // Over length
        assert!("aaaaaaaaaaaaaa".parse::<Name>().is_err());
        // Trailing dots are not normalized
        assert!("abc.".parse::<Name>().is_err());
    }

    #[test]
    fn test_name_thirteenth_char_is_narrow() {
        // The last slot only has 4 bits, chars above 'j' do not fit
        assert!("aaaaaaaaaaaaj".parse::<Name>().is_ok());
        assert!("aaaaaaaaaaaak".parse::<Name>().is_err());
    }

    #[test]
    fn test_name_constant_matches_parse() {
        const TRANSFER: Name = Name::constant("transfer");
        assert_eq!(TRANSFER, "transfer".parse().unwrap());
    }

    #[test]
    fn test_name128_round_trip() {
        for s in ["", "a", "sigil", "Domain-01", "UPPER.lower-9", "abcdefghijklmnopqrstu"] {
            let name: Name128 = s.parse().unwrap();
            assert_eq!(name.to_string(), s, "round trip failed for {:?}", s);
        }
    }

    #[test]
    fn test_name128_rejects_bad_input() {
        assert!("with space".parse::<Name128>().is_err());
        assert!("under_score".parse::<Name128>().is_err());
        assert!("abcdefghijklmnopqrstuv".parse::<Name128>().is_err());
        assert!("abc.".parse::<Name128>().is_err());
    }

    #[test]
    fn test_name128_length_tag() {
        let short: Name128 = "abcde".parse().unwrap();
        let medium: Name128 = "abcdefgh".parse().unwrap();
        let long: Name128 = "abcdefghijklmnop".parse().unwrap();
        assert_eq!(short.as_u128() & 0x3, 0);
        assert_eq!(medium.as_u128() & 0x3, 1);
        assert_eq!(long.as_u128() & 0x3, 3);
    }

    #[test]
    fn test_name128_constant_matches_parse() {
        const GROUP: Name128 = Name128::constant("group");
        assert_eq!(GROUP, "group".parse().unwrap());
    }
}
