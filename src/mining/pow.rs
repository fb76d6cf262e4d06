//! Difficulty, fees and block subsidy

use crate::core::{Block, ChainParams, ChainState, Tx, UtxoSet};
use std::cmp::Ordering;

/// Bits a block built on `prev_block_hash` must carry
///
/// Unchanged inside a difficulty period. At a period boundary the previous
/// period's elapsed time is compared against the target and bits move by
/// one step.
pub fn next_required_difficulty(chain: &ChainState, params: &ChainParams, prev_block_hash: &str) -> u8 {
    if prev_block_hash.is_empty() {
        return params.initial_difficulty_bits;
    }

    let Some((prev, location)) = chain.locate_block_in_all_chains(prev_block_hash) else {
        return params.initial_difficulty_bits;
    };
    let bits = prev.header.bits;
    let Some(prev_height) = chain.absolute_height(location) else {
        return bits;
    };

    let period = params.difficulty_period_blocks.max(1) as usize;
    if (prev_height + 1) % period != 0 {
        return bits;
    }

    let start_height = prev_height.saturating_sub(period - 1);
    let Some(period_start) = chain.block_at(location.branch, start_height) else {
        return bits;
    };

    let elapsed = prev.header.timestamp - period_start.header.timestamp;
    match elapsed.cmp(&params.difficulty_period_target_secs) {
        Ordering::Less => bits.saturating_add(1),
        Ordering::Greater => bits.saturating_sub(1),
        Ordering::Equal => bits,
    }
}

/// Fees of a candidate block; inputs resolve against the index or the
/// block's own transactions
pub fn calculate_fees(block: &Block, utxos: &UtxoSet) -> u64 {
    block
        .txs
        .iter()
        .filter(|tx| !tx.is_coinbase())
        .map(|tx| {
            let spent = tx
                .inputs
                .iter()
                .filter_map(|txin| utxos.find_output_in_block_or_index(block, txin))
                .fold(0u64, |acc, out| acc.saturating_add(out.value));
            spent.saturating_sub(sent_value(tx))
        })
        .fold(0u64, u64::saturating_add)
}

/// Fee of a single transaction against the UTXO index only
pub fn calculate_tx_fees(tx: &Tx, utxos: &UtxoSet) -> u64 {
    let spent = tx
        .inputs
        .iter()
        .filter_map(|txin| utxos.find_tx_out(txin))
        .fold(0u64, |acc, out| acc.saturating_add(out.value));
    spent.saturating_sub(sent_value(tx))
}

fn sent_value(tx: &Tx) -> u64 {
    tx.outputs
        .iter()
        .fold(0u64, |acc, out| acc.saturating_add(out.value))
}

/// Reward for a block built on an active chain of `height` blocks
pub fn block_subsidy(params: &ChainParams, height: i64) -> u64 {
    let interval = params.halve_subsidy_after_blocks.max(1);
    let halvings = height.max(0) / interval;
    subsidy_after_halvings(params, halvings)
}

pub fn subsidy_after_halvings(params: &ChainParams, halvings: i64) -> u64 {
    if halvings >= 64 {
        return 0;
    }
    (params.initial_subsidy as f64 / 2f64.powi(halvings as i32)) as u64
}
