//! Consensus parameters
//!
//! All consensus constants live in [`ChainParams`] so a node (or a test) can
//! run against a low-difficulty network without touching the validation code.

use serde::{Deserialize, Serialize};

/// Minor units per coin
pub const COIN: u64 = 100_000_000;

/// Branch index of the active chain
pub const ACTIVE_CHAIN_INDEX: usize = 0;

/// Genesis block fields
pub const GENESIS_TIMESTAMP: i64 = 1_501_821_412;
pub const GENESIS_NONCE: u64 = 13_835_058_055_287_124_368;
pub const GENESIS_REWARD: u64 = 50 * COIN;
pub const GENESIS_ADDRESS: &str = "143UVyz7ooiAv1pMqbwPPpnH4BV9ifJGFF";

/// Consensus constants for a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainParams {
    /// Largest allowed serialized block (and transaction)
    pub max_block_serialized_size: usize,
    /// Confirmations required before a coinbase output can be spent
    pub coinbase_maturity: i64,
    /// Maximum drift of a block timestamp past local time
    pub max_future_block_time_secs: i64,
    /// Upper bound on the value of a transaction's outputs
    pub max_money: u64,
    pub time_between_blocks_target_secs: i64,
    pub difficulty_period_target_secs: i64,
    pub difficulty_period_blocks: i64,
    pub initial_difficulty_bits: u8,
    pub halve_subsidy_after_blocks: i64,
    pub initial_subsidy: u64,
    /// Blocks considered for median-time-past
    pub median_time_past_blocks: usize,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            max_block_serialized_size: 1_000_000,
            coinbase_maturity: 2,
            max_future_block_time_secs: 60 * 60 * 2,
            max_money: COIN * 21_000_000,
            time_between_blocks_target_secs: 60 * 10,
            difficulty_period_target_secs: 60 * 60 * 24,
            difficulty_period_blocks: 144,
            initial_difficulty_bits: 24,
            halve_subsidy_after_blocks: 210_000,
            initial_subsidy: 50 * COIN,
            median_time_past_blocks: 11,
        }
    }
}

impl ChainParams {
    /// Mainnet parameters
    pub fn mainnet() -> Self {
        Self::default()
    }

    /// Local test network: trivial proof of work, everything else unchanged
    pub fn regtest() -> Self {
        Self {
            initial_difficulty_bits: 4,
            ..Self::default()
        }
    }

    /// Parameters by network name
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "mainnet" | "main" => Some(Self::mainnet()),
            "regtest" => Some(Self::regtest()),
            _ => None,
        }
    }
}
