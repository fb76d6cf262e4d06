//! Wallet implementation
//!
//! Key management plus the ledger-facing wallet operations:
//! - `build_input` signs a spend of one output point
//! - `Wallet::build_payment` selects coins, pays a per-byte fee and returns change
//! - `Wallet::send_value` admits the payment to the mempool and relays it
//! - `tx_status` and balances, locally or from a peer through the reply cache

use crate::core::{
    build_spend_message, Block, Encodable, LedgerState, Tx, TxIn, TxOut, TxOutPoint, TxValidationError,
    UnspentTxOut, UtxoSet,
};
use crate::crypto::{KeyError, KeyPair};
use crate::mining::MempoolAdmission;
use crate::network::{Connection, Message, MsgCache, PeerNetwork};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Length of a compact ECDSA signature, used for size estimates
const SIGNATURE_LEN: usize = 64;

/// Wallet-related errors
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("Transaction rejected: {0}")]
    Rejected(#[from] TxValidationError),
    #[error("Transaction spends unknown outputs")]
    Orphaned,
    #[error("No reply from peer")]
    Timeout,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] KeyError),
}

/// Where a transaction currently is
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TxStatus {
    Mempool,
    Mined { height: usize, block_id: String },
    NotFound,
}

/// Sign a spend of `out_point` by `key_pair`, committing to `outputs`
pub fn build_input(
    key_pair: &KeyPair,
    out_point: TxOutPoint,
    outputs: &[TxOut],
    sequence: i64,
) -> Result<TxIn, KeyError> {
    let pub_key = key_pair.public_key_bytes();
    let message = build_spend_message(&out_point, &pub_key, sequence, outputs);
    let signature = key_pair.sign(&message)?;
    Ok(TxIn::new(Some(out_point), signature, pub_key, sequence))
}

/// Status of a transaction against the local ledger
pub fn tx_status(ledger: &LedgerState, tx_id: &str) -> TxStatus {
    let guard = ledger.lock();
    if guard.mempool().contains(tx_id) {
        return TxStatus::Mempool;
    }
    status_in_blocks(guard.chain().active_chain(), tx_id)
}

fn status_in_blocks(blocks: &[Block], tx_id: &str) -> TxStatus {
    blocks
        .iter()
        .enumerate()
        .find(|(_, block)| block.txs.iter().any(|tx| tx.id() == tx_id))
        .map_or(TxStatus::NotFound, |(height, block)| TxStatus::Mined {
            height,
            block_id: block.id(),
        })
}

/// Status of a transaction as seen by a peer
pub fn remote_tx_status(
    conn: &dyn Connection,
    cache: &MsgCache,
    tx_id: &str,
) -> Result<TxStatus, WalletError> {
    cache.clear();
    conn.send(&Message::GetMempool);
    let mempool = cache.take_mempool().ok_or(WalletError::Timeout)?;
    if mempool.iter().any(|id| id == tx_id) {
        return Ok(TxStatus::Mempool);
    }

    conn.send(&Message::GetActiveChain);
    let blocks = cache.take_active_chain().ok_or(WalletError::Timeout)?;
    Ok(status_in_blocks(&blocks, tx_id))
}

/// The UTXO index of a peer
pub fn fetch_remote_utxos(
    conn: &dyn Connection,
    cache: &MsgCache,
) -> Result<Vec<UnspentTxOut>, WalletError> {
    cache.clear();
    conn.send(&Message::GetUtxos);
    let utxos = cache.take_utxos().ok_or(WalletError::Timeout)?;
    Ok(utxos.into_iter().map(|(_, utxo)| utxo).collect())
}

/// Sum of the outputs locked to `address`
pub fn balance_of(utxos: &[UnspentTxOut], address: &str) -> u64 {
    utxos
        .iter()
        .filter(|utxo| utxo.tx_out.to_address == address)
        .fold(0u64, |acc, utxo| acc.saturating_add(utxo.tx_out.value))
}

/// Serializable wallet data for persistence
#[derive(Debug, Serialize, Deserialize)]
struct WalletData {
    private_key_hex: String,
    address: String,
    label: Option<String>,
}

/// A key pair and the payments it can make
pub struct Wallet {
    key_pair: KeyPair,
    pub label: Option<String>,
}

impl Wallet {
    /// Create a new wallet with a fresh key pair
    pub fn new() -> Self {
        Self::from_key_pair(KeyPair::generate())
    }

    pub fn with_label(label: &str) -> Self {
        Self {
            label: Some(label.to_string()),
            ..Self::new()
        }
    }

    pub fn from_key_pair(key_pair: KeyPair) -> Self {
        Self {
            key_pair,
            label: None,
        }
    }

    /// Import a wallet from a private key
    pub fn from_private_key(private_key_hex: &str) -> Result<Self, WalletError> {
        Ok(Self::from_key_pair(KeyPair::from_private_key_hex(private_key_hex)?))
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn address(&self) -> String {
        self.key_pair.address()
    }

    pub fn public_key(&self) -> String {
        self.key_pair.public_key_hex()
    }

    /// Get the wallet's private key (hex)
    /// WARNING: Keep this secret!
    pub fn private_key(&self) -> String {
        self.key_pair.private_key_hex()
    }

    pub fn balance(&self, ledger: &LedgerState) -> u64 {
        ledger.balance(&self.address())
    }

    /// Outputs this wallet owns
    pub fn utxos(&self, utxos: &UtxoSet) -> Vec<UnspentTxOut> {
        utxos.for_address(&self.address()).cloned().collect()
    }

    fn estimated_size(&self, inputs: &[&UnspentTxOut], to: &str, value: u64) -> usize {
        let pub_key = self.key_pair.public_key_bytes();
        let txins = inputs
            .iter()
            .map(|utxo| {
                TxIn::new(
                    Some(utxo.tx_out_point.clone()),
                    vec![0; SIGNATURE_LEN],
                    pub_key.clone(),
                    0,
                )
            })
            .collect();
        let outputs = vec![TxOut::new(value, to), TxOut::new(0, self.address())];
        Tx::new(txins, outputs, 0).serialized_size()
    }

    /// Pay `value` to `to` from `candidates`
    ///
    /// Largest outputs are spent first; the fee is `fee_per_byte` times the
    /// estimated size and any remainder comes back as change.
    pub fn build_payment(
        &self,
        candidates: &[UnspentTxOut],
        to: &str,
        value: u64,
        fee_per_byte: u64,
    ) -> Result<Tx, WalletError> {
        let address = self.address();
        let mut owned: Vec<&UnspentTxOut> = candidates
            .iter()
            .filter(|utxo| utxo.tx_out.to_address == address)
            .collect();
        owned.sort_by(|a, b| b.tx_out.value.cmp(&a.tx_out.value));

        let mut selected = Vec::new();
        let mut total = 0u64;
        let mut need = value;
        for utxo in owned.iter().copied() {
            selected.push(utxo);
            total = total.saturating_add(utxo.tx_out.value);
            let fee = (self.estimated_size(&selected, to, value) as u64).saturating_mul(fee_per_byte);
            need = value.saturating_add(fee);
            if total >= need {
                break;
            }
        }

        if selected.is_empty() || total < need {
            let have = balance_of(candidates, &address);
            return Err(WalletError::InsufficientFunds { have, need });
        }

        let mut outputs = vec![TxOut::new(value, to)];
        let change = total - need;
        if change > 0 {
            outputs.push(TxOut::new(change, address));
        }

        let inputs = selected
            .iter()
            .map(|utxo| build_input(&self.key_pair, utxo.tx_out_point.clone(), &outputs, 0))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Tx::new(inputs, outputs, 0))
    }

    /// Build a payment from the local UTXO index, admit it and relay it
    ///
    /// Immature coinbase outputs and outputs already spent in the mempool
    /// are not candidates.
    pub fn send_value(
        &self,
        ledger: &LedgerState,
        network: &dyn PeerNetwork,
        to: &str,
        value: u64,
        fee_per_byte: u64,
    ) -> Result<Tx, WalletError> {
        let address = self.address();
        let candidates: Vec<UnspentTxOut> = {
            let guard = ledger.lock();
            let height = guard.chain().height() as i64;
            let maturity = guard.params().coinbase_maturity;
            guard
                .utxos()
                .for_address(&address)
                .filter(|utxo| !utxo.is_coinbase || height - utxo.height >= maturity)
                .filter(|utxo| guard.mempool().spender_of(&utxo.tx_out_point).is_none())
                .cloned()
                .collect()
        };

        let tx = self.build_payment(&candidates, to, value, fee_per_byte)?;
        match ledger.add_tx_to_mempool(tx.clone()) {
            MempoolAdmission::Accepted => {
                info!("Sending {} to {} in transaction {}", value, to, tx.id());
                network.broadcast(&Message::TxInfo(tx.clone()));
                Ok(tx)
            }
            MempoolAdmission::AlreadyKnown => Ok(tx),
            MempoolAdmission::Orphaned => Err(WalletError::Orphaned),
            MempoolAdmission::Rejected(e) => {
                warn!("Payment {} rejected: {}", tx.id(), e);
                Err(e.into())
            }
        }
    }

    /// Save wallet to file
    pub fn save(&self, path: &Path) -> Result<(), WalletError> {
        let data = WalletData {
            private_key_hex: self.private_key(),
            address: self.address(),
            label: self.label.clone(),
        };

        let json = serde_json::to_string_pretty(&data)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load wallet from file
    pub fn load(path: &Path) -> Result<Self, WalletError> {
        let json = fs::read_to_string(path)?;
        let data: WalletData = serde_json::from_str(&json)?;

        let mut wallet = Self::from_private_key(&data.private_key_hex)?;
        wallet.label = data.label;
        Ok(wallet)
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

/// Wallet files in a directory, one `<address>.json` per wallet
pub struct WalletManager {
    wallets_dir: PathBuf,
}

impl WalletManager {
    pub fn new(wallets_dir: &Path) -> Result<Self, WalletError> {
        fs::create_dir_all(wallets_dir)?;
        Ok(Self {
            wallets_dir: wallets_dir.to_path_buf(),
        })
    }

    fn wallet_path(&self, address: &str) -> PathBuf {
        self.wallets_dir.join(format!("{}.json", address))
    }

    /// Create and save a new wallet
    pub fn create_wallet(&self, label: Option<&str>) -> Result<Wallet, WalletError> {
        let wallet = match label {
            Some(l) => Wallet::with_label(l),
            None => Wallet::new(),
        };
        wallet.save(&self.wallet_path(&wallet.address()))?;
        Ok(wallet)
    }

    /// Addresses of every readable wallet file, sorted
    pub fn list_wallets(&self) -> Result<Vec<String>, WalletError> {
        let mut addresses = Vec::new();
        for entry in fs::read_dir(&self.wallets_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match Wallet::load(&path) {
                    Ok(wallet) => addresses.push(wallet.address()),
                    Err(e) => warn!("Skipping unreadable wallet {:?}: {}", path, e),
                }
            }
        }
        addresses.sort();
        Ok(addresses)
    }

    pub fn load_wallet(&self, address: &str) -> Result<Wallet, WalletError> {
        Wallet::load(&self.wallet_path(address))
    }
}
