//! CLI commands for the node
//!
//! Each command runs against a standalone node: the chain is loaded from
//! the data directory, the command runs, and the chain is saved again.

use crate::config::NodeConfig;
use crate::core::LedgerState;
use crate::mining::{next_required_difficulty, Miner};
use crate::network::NullNetwork;
use crate::storage::{Storage, StorageStats};
use crate::wallet::{self, WalletManager};
use serde::Serialize;
use std::sync::Arc;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Application state
pub struct AppState {
    pub config: NodeConfig,
    pub ledger: Arc<LedgerState>,
    pub storage: Storage,
    pub wallet_manager: WalletManager,
}

impl AppState {
    /// Open the data directory and load the stored chain
    pub fn new(config: NodeConfig) -> CliResult<Self> {
        let params = config.chain_params()?;
        let ledger = Arc::new(LedgerState::with_mempool_policy(params, config.mempool.clone()));
        let storage = Storage::new(config.storage.clone())?;
        let wallet_manager = WalletManager::new(&config.wallets_dir())?;

        if storage.exists() {
            println!("📂 Loading existing chain...");
            storage.load_chain(&ledger)?;
        } else {
            println!("🆕 Starting a new chain from genesis...");
            storage.save_chain(&ledger)?;
        }

        Ok(Self {
            config,
            ledger,
            storage,
            wallet_manager,
        })
    }

    fn miner(&self) -> Miner {
        Miner::new(Arc::clone(&self.ledger), self.config.miner.clone())
    }
}

/// Mine `count` blocks, or keep mining until the process is stopped
pub fn cmd_mine(state: &AppState, address: &str, count: Option<usize>) -> CliResult<()> {
    let miner = state.miner();

    let Some(count) = count else {
        println!("⛏️  Mining to {} until stopped", address);
        miner.mine_forever(address, &state.storage, &NullNetwork)?;
        return Ok(());
    };

    println!("⛏️  Mining {} block(s) for address: {}", count, address);
    for (block, stats) in miner.mine_blocks(address, count, Some(&state.storage), &NullNetwork)? {
        println!("\n   Block {} mined!", &block.id()[..16]);
        println!("   ├─ Transactions: {}", block.txs.len());
        println!("   ├─ Time: {}ms", stats.time_ms);
        println!("   ├─ Attempts: {}", stats.hash_attempts);
        println!("   └─ Hash rate: {:.2} H/s", stats.hash_rate);
    }

    println!("\n💰 New balance for miner: {}", state.ledger.balance(address));
    Ok(())
}

/// Create a new wallet
pub fn cmd_wallet_new(state: &AppState, label: Option<&str>) -> CliResult<()> {
    let wallet = state.wallet_manager.create_wallet(label)?;

    println!("🔐 New wallet created!");
    println!("   📍 Address: {}", wallet.address());
    println!("   🔑 Public Key: {}...", &wallet.public_key()[..32]);
    if let Some(l) = &wallet.label {
        println!("   🏷️  Label: {}", l);
    }
    println!("\n   ⚠️  IMPORTANT: Your private key is stored in the wallets directory.");
    println!("   Back up this directory to avoid losing access to your funds!");

    Ok(())
}

/// List all wallets
pub fn cmd_wallet_list(state: &AppState) -> CliResult<()> {
    let addresses = state.wallet_manager.list_wallets()?;

    if addresses.is_empty() {
        println!("📭 No wallets found. Create one with: tinycoin wallet new");
        return Ok(());
    }

    println!("📋 Wallets:");
    for address in &addresses {
        let wallet = state.wallet_manager.load_wallet(address)?;
        let label = wallet.label.as_deref().unwrap_or("-");
        println!("   {} ({}) - {}", address, label, wallet.balance(&state.ledger));
    }

    Ok(())
}

/// Show the balance and outputs of an address
pub fn cmd_balance(state: &AppState, address: &str) -> CliResult<()> {
    let utxos = state.ledger.utxos_snapshot();
    let mut owned: Vec<_> = utxos.for_address(address).collect();
    owned.sort_by(|a, b| a.tx_out_point.cmp(&b.tx_out_point));

    println!("💰 Balance for {}", address);
    println!("   Total: {}", utxos.balance(address));
    println!("   UTXOs: {}", owned.len());

    if !owned.is_empty() {
        println!("\n   Transaction outputs:");
        for utxo in owned.iter().take(10) {
            println!(
                "   └─ {}:{} = {}{}",
                &utxo.tx_out_point.tx_id[..8],
                utxo.tx_out_point.output_index,
                utxo.tx_out.value,
                if utxo.is_coinbase { " (coinbase)" } else { "" }
            );
        }
        if owned.len() > 10 {
            println!("   ... and {} more", owned.len() - 10);
        }
    }

    Ok(())
}

/// Pay `value` from a stored wallet
///
/// The mempool does not outlive the process, so `confirm` mines a block
/// holding the payment before returning.
pub fn cmd_send(
    state: &AppState,
    from: &str,
    to: &str,
    value: u64,
    fee_per_byte: u64,
    confirm: bool,
) -> CliResult<()> {
    let sender = state.wallet_manager.load_wallet(from)?;
    let tx = sender.send_value(&state.ledger, &NullNetwork, to, value, fee_per_byte)?;

    println!("📤 Transaction created:");
    println!("   ID: {}", tx.id());
    println!("   From: {}", from);
    println!("   To: {}", to);
    println!("   Value: {}", value);

    if confirm {
        state
            .miner()
            .mine_blocks(from, 1, Some(&state.storage), &NullNetwork)?;
        println!("\n✅ Transaction mined: {:?}", wallet::tx_status(&state.ledger, &tx.id()));
    } else {
        println!("\n✅ Transaction added to mempool");
    }

    Ok(())
}

/// Print where a transaction is as JSON
pub fn cmd_tx_status(state: &AppState, tx_id: &str) -> CliResult<()> {
    let status = wallet::tx_status(&state.ledger, tx_id);
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Node summary printed by `info`
#[derive(Debug, Serialize)]
pub struct ChainInfo {
    pub network: String,
    pub height: usize,
    pub tip: String,
    pub next_difficulty_bits: u8,
    pub side_branches: usize,
    pub orphan_blocks: usize,
    pub mempool_size: usize,
    pub utxo_count: usize,
    pub initial_sync_complete: bool,
    pub storage: StorageStats,
}

pub fn chain_info(state: &AppState) -> CliResult<ChainInfo> {
    let storage = state.storage.stats()?;
    let guard = state.ledger.lock();
    let chain = guard.chain();
    let tip = chain.tip().id();

    Ok(ChainInfo {
        network: state.config.network.clone(),
        height: chain.tip_height(),
        next_difficulty_bits: next_required_difficulty(chain, guard.params(), &tip),
        tip,
        side_branches: chain.side_branches().len(),
        orphan_blocks: chain.orphan_blocks().len(),
        mempool_size: guard.mempool().len(),
        utxo_count: guard.utxos().len(),
        initial_sync_complete: state.ledger.is_initial_sync_complete(),
        storage,
    })
}

/// Print the node summary as JSON
pub fn cmd_info(state: &AppState) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(&chain_info(state)?)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::TxStatus;

    fn regtest_state(dir: &std::path::Path) -> AppState {
        let mut config = NodeConfig {
            network: "regtest".to_string(),
            ..Default::default()
        };
        config.storage.data_dir = dir.to_path_buf();
        AppState::new(config).unwrap()
    }

    #[test]
    fn test_mine_and_reload() {
        let temp_dir = tempfile::tempdir().unwrap();
        let state = regtest_state(temp_dir.path());
        cmd_mine(&state, "miner", Some(2)).unwrap();
        let tip = state.ledger.tip_id();

        let reopened = regtest_state(temp_dir.path());
        assert_eq!(reopened.ledger.tip_id(), tip);

        let info = chain_info(&reopened).unwrap();
        assert_eq!(info.height, 2);
        assert_eq!(info.tip, tip);
        assert_eq!(info.mempool_size, 0);
    }

    #[test]
    fn test_send_with_confirm() {
        let temp_dir = tempfile::tempdir().unwrap();
        let state = regtest_state(temp_dir.path());
        let wallet = state.wallet_manager.create_wallet(Some("payer")).unwrap();
        let address = wallet.address();

        cmd_mine(&state, &address, Some(3)).unwrap();
        cmd_send(&state, &address, "bob", 1_000, 1, true).unwrap();

        assert_eq!(state.ledger.balance("bob"), 1_000);
        let payment_id = state.ledger.tip().txs[1].id();
        assert!(matches!(
            wallet::tx_status(&state.ledger, &payment_id),
            TxStatus::Mined { height: 4, .. }
        ));
    }
}
