use std::fmt::{Display, Error as FmtError, Formatter};

use serde::{Deserialize, Serialize};

use crate::serializer::{Reader, ReaderError, Serializer, Writer};

// Blocks are produced on a fixed 500 ms grid counted from the chain epoch
pub const BLOCK_INTERVAL_MS: u64 = 500;
// 2000-01-01T00:00:00.000 UTC in unix milliseconds
pub const BLOCK_TIMESTAMP_EPOCH_MS: u64 = 946_684_800_000;

// One second resolution point in time, unix seconds
#[derive(Serialize, Deserialize, Eq, PartialEq, PartialOrd, Ord, Clone, Copy, Debug, Hash, Default)]
pub struct TimePointSec(u32);

impl TimePointSec {
    pub const fn new(seconds: u32) -> Self {
        TimePointSec(seconds)
    }

    pub const fn as_secs(&self) -> u32 {
        self.0
    }

    pub fn plus_secs(&self, seconds: u32) -> Self {
        TimePointSec(self.0.saturating_add(seconds))
    }
}

impl Display for TimePointSec {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "{}s", self.0)
    }
}

impl Serializer for TimePointSec {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.0);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(TimePointSec(reader.read_u32()?))
    }

    fn size(&self) -> usize {
        4
    }
}

// Block production slot since the chain epoch
#[derive(Serialize, Deserialize, Eq, PartialEq, PartialOrd, Ord, Clone, Copy, Debug, Hash, Default)]
pub struct BlockTimestamp(u32);

impl BlockTimestamp {
    pub const fn new(slot: u32) -> Self {
        BlockTimestamp(slot)
    }

    pub const fn slot(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> Self {
        BlockTimestamp(self.0 + 1)
    }

    pub fn from_unix_millis(millis: u64) -> Self {
        let since_epoch = millis.saturating_sub(BLOCK_TIMESTAMP_EPOCH_MS);
        BlockTimestamp((since_epoch / BLOCK_INTERVAL_MS) as u32)
    }

    pub fn to_unix_millis(&self) -> u64 {
        BLOCK_TIMESTAMP_EPOCH_MS + self.0 as u64 * BLOCK_INTERVAL_MS
    }

    pub fn to_time_point_sec(&self) -> TimePointSec {
        TimePointSec((self.to_unix_millis() / 1000) as u32)
    }
}

impl Display for BlockTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        write!(f, "slot {}", self.0)
    }
}

impl Serializer for BlockTimestamp {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(self.0);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(BlockTimestamp(reader.read_u32()?))
    }

    fn size(&self) -> usize {
        4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_timestamp_millis_round_trip() {
        let ts = BlockTimestamp::new(1_000_000);
        assert_eq!(BlockTimestamp::from_unix_millis(ts.to_unix_millis()), ts);
    }

    #[test]
    fn test_block_timestamp_epoch() {
        let genesis = BlockTimestamp::from_unix_millis(BLOCK_TIMESTAMP_EPOCH_MS);
        assert_eq!(genesis.slot(), 0);
        assert_eq!(genesis.to_time_point_sec().as_secs(), 946_684_800);
    }
}
