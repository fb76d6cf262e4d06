//! Block production: mempool, proof-of-work rules and the miner

pub mod mempool;
pub mod miner;
pub mod pow;

pub use mempool::{Mempool, MempoolAdmission, MempoolPolicy, SelectionOrder, MAX_ORPHAN_TXS};
pub use miner::{mine, Miner, MinerConfig, MiningError, MiningStats};
pub use pow::{
    block_subsidy, calculate_fees, calculate_tx_fees, next_required_difficulty,
    subsidy_after_halvings,
};
