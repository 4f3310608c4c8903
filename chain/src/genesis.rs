use serde::{Deserialize, Serialize};
use sigil_common::{
    config::ChainConfig,
    crypto::{hash, Hash, PublicKey},
    serializer::{Reader, ReaderError, Serializer, Writer},
    time::BlockTimestamp,
};

// Everything a brand-new chain is born with. The chain id is the digest
// of this state, so two chains differing in any genesis parameter can
// never accept each other's transactions.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct GenesisState {
    pub initial_timestamp: BlockTimestamp,
    pub initial_key: PublicKey,
    pub initial_configuration: ChainConfig,
}

impl GenesisState {
    pub fn new(initial_timestamp: BlockTimestamp, initial_key: PublicKey) -> Self {
        Self {
            initial_timestamp,
            initial_key,
            initial_configuration: ChainConfig::default(),
        }
    }

    pub fn compute_chain_id(&self) -> Hash {
        hash(&self.to_bytes())
    }

    // Genesis files are distributed as JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl Serializer for GenesisState {
    fn write(&self, writer: &mut Writer) {
        self.initial_timestamp.write(writer);
        self.initial_key.write(writer);
        self.initial_configuration.write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Self {
            initial_timestamp: BlockTimestamp::read(reader)?,
            initial_key: PublicKey::read(reader)?,
            initial_configuration: ChainConfig::read(reader)?,
        })
    }

    fn size(&self) -> usize {
        self.initial_timestamp.size() + self.initial_key.size() + self.initial_configuration.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigil_common::crypto::KeyPair;

    #[test]
    fn test_chain_id_depends_on_every_field() {
        let key = KeyPair::random().public_key().clone();
        let genesis = GenesisState::new(BlockTimestamp::new(1000), key.clone());
        let id = genesis.compute_chain_id();

        // Deterministic
        assert_eq!(genesis.compute_chain_id(), id);

        let mut other = genesis.clone();
        other.initial_timestamp = BlockTimestamp::new(1001);
        assert_ne!(other.compute_chain_id(), id);

        let mut other = genesis.clone();
        other.initial_configuration.max_authority_depth += 1;
        assert_ne!(other.compute_chain_id(), id);
    }

    #[test]
    fn test_json_round_trip() {
        let key = KeyPair::random().public_key().clone();
        let genesis = GenesisState::new(BlockTimestamp::new(1000), key);
        let json = genesis.to_json().unwrap();
        let decoded = GenesisState::from_json(&json).unwrap();
        assert_eq!(decoded, genesis);
        assert_eq!(decoded.compute_chain_id(), genesis.compute_chain_id());
    }
}
