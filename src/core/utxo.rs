//! UTXO index
//!
//! Maps each spendable output point to its output. The index always reflects
//! the tip of the active chain; side-branch blocks never touch it.

use crate::core::block::Block;
use crate::core::codec::{BinaryBuffer, CodecError, Decodable, Encodable};
use crate::core::transaction::{Tx, TxIn, TxOut, TxOutPoint};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Height recorded for outputs that are not committed to the chain
pub const UNCONFIRMED_HEIGHT: i64 = -1;

/// An unspent output and where it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentTxOut {
    pub tx_out: TxOut,
    pub tx_out_point: TxOutPoint,
    pub is_coinbase: bool,
    /// Active-chain length when the creating block was connected
    pub height: i64,
}

impl UnspentTxOut {
    pub fn new(tx_out: TxOut, tx_out_point: TxOutPoint, is_coinbase: bool, height: i64) -> Self {
        Self {
            tx_out,
            tx_out_point,
            is_coinbase,
            height,
        }
    }
}

impl Encodable for UnspentTxOut {
    fn encode(&self, buf: &mut BinaryBuffer) {
        self.tx_out.encode(buf);
        self.tx_out_point.encode(buf);
        buf.write_fixed(self.is_coinbase);
        buf.write_fixed(self.height);
    }
}

impl Decodable for UnspentTxOut {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            tx_out: TxOut::decode(buf)?,
            tx_out_point: TxOutPoint::decode(buf)?,
            is_coinbase: buf.read_fixed()?,
            height: buf.read_fixed()?,
        })
    }
}

/// Output of `tx` at `index`, if the index is in range
pub(crate) fn output_at(tx: &Tx, index: i64) -> Option<&TxOut> {
    usize::try_from(index).ok().and_then(|i| tx.outputs.get(i))
}

/// The set of unspent outputs at the active tip
#[derive(Debug, Clone, Default)]
pub struct UtxoSet {
    map: HashMap<TxOutPoint, UnspentTxOut>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `(tx_id, index)`
    pub fn add(&mut self, tx_out: TxOut, tx_id: &str, index: i64, is_coinbase: bool, height: i64) {
        let out_point = TxOutPoint::new(tx_id, index);
        let utxo = UnspentTxOut::new(tx_out, out_point.clone(), is_coinbase, height);
        self.map.insert(out_point, utxo);
    }

    /// Remove the entry if present
    pub fn remove(&mut self, tx_id: &str, index: i64) -> Option<UnspentTxOut> {
        self.map.remove(&TxOutPoint::new(tx_id, index))
    }

    pub fn find(&self, out_point: &TxOutPoint) -> Option<&UnspentTxOut> {
        self.map.get(out_point)
    }

    pub fn contains(&self, out_point: &TxOutPoint) -> bool {
        self.map.contains_key(out_point)
    }

    /// Output an input spends, from the index only
    pub fn find_tx_out(&self, txin: &TxIn) -> Option<&TxOut> {
        txin.to_spend
            .as_ref()
            .and_then(|point| self.find(point))
            .map(|utxo| &utxo.tx_out)
    }

    /// Resolve an input against uncommitted transactions
    pub fn find_in_list(txin: &TxIn, txs: &[Tx]) -> Option<UnspentTxOut> {
        let to_spend = txin.to_spend.as_ref()?;
        let tx = txs.iter().find(|tx| tx.id() == to_spend.tx_id)?;
        let tx_out = output_at(tx, to_spend.output_index)?;
        Some(UnspentTxOut::new(
            tx_out.clone(),
            to_spend.clone(),
            false,
            UNCONFIRMED_HEIGHT,
        ))
    }

    /// Output an input spends, from the index or else the candidate block
    pub fn find_output_in_block_or_index(&self, block: &Block, txin: &TxIn) -> Option<TxOut> {
        if let Some(tx_out) = self.find_tx_out(txin) {
            return Some(tx_out.clone());
        }
        Self::find_in_list(txin, &block.txs).map(|utxo| utxo.tx_out)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnspentTxOut> {
        self.map.values()
    }

    /// Outputs locked to `address`
    pub fn for_address<'a>(&'a self, address: &'a str) -> impl Iterator<Item = &'a UnspentTxOut> {
        self.map
            .values()
            .filter(move |utxo| utxo.tx_out.to_address == address)
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.for_address(address)
            .fold(0u64, |acc, utxo| acc.saturating_add(utxo.tx_out.value))
    }

    /// Copy of the whole index, as sent to wallet peers
    pub fn snapshot(&self) -> HashMap<TxOutPoint, UnspentTxOut> {
        self.map.clone()
    }
}
