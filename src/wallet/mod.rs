//! Wallet module for key and transaction management

pub mod wallet;

pub use wallet::{
    balance_of, build_input, fetch_remote_utxos, remote_tx_status, tx_status, TxStatus, Wallet,
    WalletError, WalletManager,
};
