use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::serializer::{Reader, ReaderError, Serializer, Writer};

// Wire overhead accounted to every packed transaction on top of its payload
pub const FIXED_NET_OVERHEAD_OF_PACKED_TRX: u64 = 16;
// Bytes per billed net usage word
pub const NET_USAGE_WORD_SIZE: u64 = 8;
// Producers repeat this many consecutive slots before the schedule moves on
pub const PRODUCER_REPETITIONS: u32 = 12;
// Decompressing a packed transaction may not expand past this
pub const MAX_DECOMPRESSED_TRX_SIZE: usize = 1024 * 1024;

pub const DEFAULT_MAX_BLOCK_NET_USAGE: u64 = 1024 * 1024;
pub const DEFAULT_TARGET_BLOCK_NET_USAGE_PCT: u32 = 10 * 100; // 10%, in units of 0.01%
pub const DEFAULT_MAX_TRANSACTION_NET_USAGE: u32 = (DEFAULT_MAX_BLOCK_NET_USAGE / 2) as u32;
pub const DEFAULT_BASE_PER_TRANSACTION_NET_USAGE: u32 = 12;
pub const DEFAULT_NET_USAGE_LEEWAY: u32 = 500;
pub const DEFAULT_MAX_TRX_LIFETIME: u32 = 60 * 60; // 1 hour
pub const DEFAULT_DEFERRED_TRX_EXPIRATION_WINDOW: u32 = 10 * 60; // 10 minutes
pub const DEFAULT_MAX_TRX_DELAY: u32 = 45 * 24 * 3600; // 45 days
pub const DEFAULT_MAX_INLINE_ACTION_SIZE: u32 = 4096;
pub const DEFAULT_MAX_INLINE_ACTION_DEPTH: u16 = 4;
pub const DEFAULT_MAX_AUTH_DEPTH: u16 = 6;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("target block net usage percentage must be between 0 and 100%")]
    InvalidTargetNetUsagePct,
    #[error("max transaction net usage must be less than max block net usage")]
    TrxNetUsageTooLarge,
    #[error("max transaction lifetime must be positive")]
    ZeroTrxLifetime,
    #[error("max authority depth must be positive")]
    ZeroAuthorityDepth,
}

// Consensus-critical chain limits, fixed at genesis
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChainConfig {
    pub max_block_net_usage: u64,
    pub target_block_net_usage_pct: u32,
    pub max_transaction_net_usage: u32,
    pub base_per_transaction_net_usage: u32,
    pub net_usage_leeway: u32,

    pub max_transaction_lifetime: u32,
    pub deferred_trx_expiration_window: u32,
    pub max_transaction_delay: u32,
    pub max_inline_action_size: u32,
    pub max_inline_action_depth: u16,
    pub max_authority_depth: u16,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            max_block_net_usage: DEFAULT_MAX_BLOCK_NET_USAGE,
            target_block_net_usage_pct: DEFAULT_TARGET_BLOCK_NET_USAGE_PCT,
            max_transaction_net_usage: DEFAULT_MAX_TRANSACTION_NET_USAGE,
            base_per_transaction_net_usage: DEFAULT_BASE_PER_TRANSACTION_NET_USAGE,
            net_usage_leeway: DEFAULT_NET_USAGE_LEEWAY,
            max_transaction_lifetime: DEFAULT_MAX_TRX_LIFETIME,
            deferred_trx_expiration_window: DEFAULT_DEFERRED_TRX_EXPIRATION_WINDOW,
            max_transaction_delay: DEFAULT_MAX_TRX_DELAY,
            max_inline_action_size: DEFAULT_MAX_INLINE_ACTION_SIZE,
            max_inline_action_depth: DEFAULT_MAX_INLINE_ACTION_DEPTH,
            max_authority_depth: DEFAULT_MAX_AUTH_DEPTH,
        }
    }
}

impl ChainConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_block_net_usage_pct > 100 * 100 {
            return Err(ConfigError::InvalidTargetNetUsagePct);
        }
        if self.max_transaction_net_usage as u64 >= self.max_block_net_usage {
            return Err(ConfigError::TrxNetUsageTooLarge);
        }
        if self.max_transaction_lifetime == 0 {
            return Err(ConfigError::ZeroTrxLifetime);
        }
        if self.max_authority_depth == 0 {
            return Err(ConfigError::ZeroAuthorityDepth);
        }
        Ok(())
    }
}

impl Serializer for ChainConfig {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(self.max_block_net_usage);
        writer.write_u32(self.target_block_net_usage_pct);
        writer.write_u32(self.max_transaction_net_usage);
        writer.write_u32(self.base_per_transaction_net_usage);
        writer.write_u32(self.net_usage_leeway);
        writer.write_u32(self.max_transaction_lifetime);
        writer.write_u32(self.deferred_trx_expiration_window);
        writer.write_u32(self.max_transaction_delay);
        writer.write_u32(self.max_inline_action_size);
        writer.write_u16(self.max_inline_action_depth);
        writer.write_u16(self.max_authority_depth);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            max_block_net_usage: reader.read_u64()?,
            target_block_net_usage_pct: reader.read_u32()?,
            max_transaction_net_usage: reader.read_u32()?,
            base_per_transaction_net_usage: reader.read_u32()?,
            net_usage_leeway: reader.read_u32()?,
            max_transaction_lifetime: reader.read_u32()?,
            deferred_trx_expiration_window: reader.read_u32()?,
            max_transaction_delay: reader.read_u32()?,
            max_inline_action_size: reader.read_u32()?,
            max_inline_action_depth: reader.read_u16()?,
            max_authority_depth: reader.read_u16()?,
        })
    }

    fn size(&self) -> usize {
        8 + 4 * 7 + 2 * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ChainConfig::default().validate().is_ok());
    }

    #[test]
    fn test_round_trip() {
        let config = ChainConfig::default();
        assert_eq!(ChainConfig::from_bytes(&config.to_bytes()).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_oversized_trx_net() {
        let mut config = ChainConfig::default();
        config.max_transaction_net_usage = config.max_block_net_usage as u32;
        assert!(config.validate().is_err());
    }
}
