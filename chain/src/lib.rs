pub mod authority_checker;
pub mod block_log;
pub mod block_state;
pub mod config;
pub mod contracts;
pub mod controller;
pub mod error;
pub mod fork_db;
pub mod genesis;
pub mod metadata;
pub mod reversible;
pub mod signal;
pub mod state;
pub mod store;
pub mod tokendb;
pub mod trx_context;
