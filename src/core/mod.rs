//! Core ledger components
//!
//! - Binary codec every entity serializes through
//! - Transactions (UTXO model, ECDSA spend authorization)
//! - UTXO index
//! - Blocks and consensus parameters
//! - Chain state machine (side branches, orphans, reorgs)
//! - Shared ledger state with ordered locking

pub mod block;
pub mod chain;
pub mod codec;
pub mod ledger;
pub mod params;
pub mod transaction;
pub mod utxo;

pub use block::{Block, BlockHeader};
pub use chain::{BlockLocation, BlockValidationError, ChainState, FoundTxOut, MAX_ORPHAN_BLOCKS};
pub use codec::{BinaryBuffer, CodecError, Decodable, Encodable};
pub use ledger::{LedgerGuard, LedgerState};
pub use params::{ChainParams, ACTIVE_CHAIN_INDEX, COIN};
pub use transaction::{
    build_spend_message, validate_signature_for_spend, Tx, TxIn, TxOut, TxOutPoint,
    TxUnlockError, TxValidationError, ValidateRequest, ValidationContext, COINBASE_SEQUENCE,
};
pub use utxo::{UnspentTxOut, UtxoSet, UNCONFIRMED_HEIGHT};
