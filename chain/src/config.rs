use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::genesis::GenesisState;

pub const DEFAULT_STATE_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_REVERSIBLE_CACHE_SIZE: u64 = 340 * 1024 * 1024;

// Controller configuration; everything consensus-relevant lives inside
// `genesis`, the rest is node-local
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub state_dir: PathBuf,
    pub blocks_dir: PathBuf,
    pub tokendb_dir: PathBuf,
    pub state_size: u64,
    pub reversible_cache_size: u64,
    pub read_only: bool,
    pub force_all_checks: bool,
    pub contracts_console: bool,
    pub genesis: GenesisState,
}

impl Config {
    // Standard layout under one data directory
    pub fn with_base_dir<P: Into<PathBuf>>(base_dir: P, genesis: GenesisState) -> Self {
        let base_dir = base_dir.into();
        Self {
            state_dir: base_dir.join("state"),
            blocks_dir: base_dir.join("blocks"),
            tokendb_dir: base_dir.join("tokendb"),
            state_size: DEFAULT_STATE_SIZE,
            reversible_cache_size: DEFAULT_REVERSIBLE_CACHE_SIZE,
            read_only: false,
            force_all_checks: false,
            contracts_console: false,
            genesis,
        }
    }

    pub fn reversible_blocks_dir(&self) -> PathBuf {
        self.blocks_dir.join("reversible")
    }
}
