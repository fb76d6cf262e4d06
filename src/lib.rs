//! TinyCoin: a small proof-of-work cryptocurrency node
//!
//! This crate provides:
//! - A canonical little-endian binary codec for every consensus entity
//! - UTXO transactions with secp256k1 signatures and coinbase maturity
//! - A multi-branch block store with orphan handling and reorganization
//! - A mempool with orphan transactions and fee-ordered block assembly
//! - Multithreaded proof-of-work mining with difficulty retargeting
//! - The peer message set and its handlers
//! - Chain persistence, wallets and a CLI
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tinycoin::core::{ChainParams, LedgerState};
//! use tinycoin::mining::{Miner, MinerConfig};
//! use tinycoin::network::NullNetwork;
//! use tinycoin::wallet::Wallet;
//!
//! let ledger = Arc::new(LedgerState::new(ChainParams::regtest()));
//! let wallet = Wallet::new();
//!
//! let miner = Miner::new(Arc::clone(&ledger), MinerConfig::default());
//! let mined = miner.mine_blocks(&wallet.address(), 3, None, &NullNetwork).unwrap();
//! println!("Mined {} blocks, tip {}", mined.len(), ledger.tip_id());
//! println!("Balance: {}", wallet.balance(&ledger));
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod crypto;
pub mod mining;
pub mod network;
pub mod storage;
pub mod wallet;

// Re-export commonly used types
pub use config::{ConfigError, NodeConfig};
pub use core::{Block, ChainParams, LedgerState, Tx, TxIn, TxOut, TxOutPoint, COIN};
pub use crypto::KeyPair;
pub use mining::{Mempool, Miner, MinerConfig};
pub use network::{Message, MessageHandler, NullNetwork, PeerNetwork};
pub use storage::{Storage, StorageConfig};
pub use wallet::{TxStatus, Wallet};
