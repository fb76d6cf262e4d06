//! Transaction pool (mempool) for pending transactions
//!
//! Holds validated, unconfirmed transactions plus an orphan list of
//! transactions whose inputs are not known yet. Block assembly pulls from
//! here with dependency-first insertion:
//! - a transaction is preceded by any mempool parent it spends
//! - a missing parent or a cycle abandons that transaction only
//! - every append is size-checked against the whole serialized block

use crate::core::codec::Encodable;
use crate::core::{
    Block, ChainParams, Tx, TxOutPoint, TxValidationError, UnspentTxOut, UtxoSet,
    ValidateRequest, ValidationContext, UNCONFIRMED_HEIGHT,
};
use crate::core::utxo::output_at;
use crate::mining::pow::calculate_tx_fees;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

// =============================================================================
// Configuration
// =============================================================================

/// Maximum number of orphan transactions kept for later retry
pub const MAX_ORPHAN_TXS: usize = 100;

/// Order in which block assembly considers mempool transactions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionOrder {
    /// Cheapest first; the historical network behavior
    #[default]
    AscendingFee,
    /// Richest first
    DescendingFee,
}

impl SelectionOrder {
    /// Sort `(fee, tx_id)` pairs; ties break on id so selection is stable
    pub fn sort(self, entries: &mut [(u64, String)]) {
        match self {
            SelectionOrder::AscendingFee => {
                entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
            }
            SelectionOrder::DescendingFee => {
                entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)))
            }
        }
    }
}

/// Admission and selection policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolPolicy {
    pub order: SelectionOrder,
    /// Let admission resolve inputs against other mempool transactions
    pub allow_unconfirmed_parents: bool,
}

// =============================================================================
// Admission Result
// =============================================================================

/// What happened to a submitted transaction
#[derive(Debug, Clone, PartialEq)]
pub enum MempoolAdmission {
    Accepted,
    AlreadyKnown,
    /// Parked until its missing inputs show up
    Orphaned,
    Rejected(TxValidationError),
}

impl MempoolAdmission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, MempoolAdmission::Accepted)
    }
}

// =============================================================================
// Mempool
// =============================================================================

/// Memory pool for pending transactions
#[derive(Debug, Default)]
pub struct Mempool {
    /// Transactions indexed by id
    txs: HashMap<String, Tx>,
    /// Transactions waiting for unknown inputs, oldest first
    orphans: Vec<Tx>,
    policy: MempoolPolicy,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: MempoolPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> &MempoolPolicy {
        &self.policy
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.txs.contains_key(tx_id)
    }

    pub fn get(&self, tx_id: &str) -> Option<&Tx> {
        self.txs.get(tx_id)
    }

    pub fn tx_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.txs.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn orphans(&self) -> &[Tx] {
        &self.orphans
    }

    /// Insert without validation, as done when a block is disconnected
    pub fn insert(&mut self, tx: Tx) {
        self.txs.insert(tx.id(), tx);
    }

    pub fn remove(&mut self, tx_id: &str) -> Option<Tx> {
        self.txs.remove(tx_id)
    }

    pub fn clear(&mut self) {
        self.txs.clear();
        self.orphans.clear();
    }

    /// Drain the orphan list for another admission attempt
    pub fn take_orphans(&mut self) -> Vec<Tx> {
        std::mem::take(&mut self.orphans)
    }

    /// Resolve an output point against an unconfirmed transaction
    pub fn find_utxo_in_mempool(&self, out_point: &TxOutPoint) -> Option<UnspentTxOut> {
        let tx = self.txs.get(&out_point.tx_id)?;
        let tx_out = output_at(tx, out_point.output_index)?;
        Some(UnspentTxOut::new(
            tx_out.clone(),
            out_point.clone(),
            false,
            UNCONFIRMED_HEIGHT,
        ))
    }

    /// Id of the mempool transaction already spending `out_point`
    pub fn spender_of(&self, out_point: &TxOutPoint) -> Option<&str> {
        self.txs
            .iter()
            .find(|(_, tx)| {
                tx.inputs
                    .iter()
                    .any(|txin| txin.to_spend.as_ref() == Some(out_point))
            })
            .map(|(id, _)| id.as_str())
    }

    /// Validate and admit a transaction
    pub fn add(
        &mut self,
        tx: Tx,
        utxos: &UtxoSet,
        current_height: i64,
        params: &ChainParams,
    ) -> MempoolAdmission {
        let tx_id = tx.id();
        if self.txs.contains_key(&tx_id) {
            info!("Transaction {} already seen", tx_id);
            return MempoolAdmission::AlreadyKnown;
        }

        let conflict = tx
            .inputs
            .iter()
            .filter_map(|txin| txin.to_spend.as_ref())
            .find_map(|point| self.spender_of(point))
            .map(str::to_string);
        if let Some(other) = conflict {
            warn!("Transaction {} conflicts with {}, rejected", tx_id, other);
            return MempoolAdmission::Rejected(TxValidationError::MempoolConflict(other));
        }

        let result = {
            let ctx = ValidationContext {
                utxos,
                mempool: Some(self),
                current_height,
                params,
            };
            let req = ValidateRequest {
                allow_utxo_from_mempool: self.policy.allow_unconfirmed_parents,
                ..ValidateRequest::default()
            };
            tx.validate(&ctx, &req)
        };

        match result {
            Ok(()) => {
                info!("Transaction {} added to mempool", tx_id);
                self.txs.insert(tx_id, tx);
                MempoolAdmission::Accepted
            }
            Err(err) if err.is_orphan() => {
                info!("Transaction {} submitted as orphan", tx_id);
                if let Some(orphan) = err.into_orphan() {
                    self.push_orphan(orphan);
                }
                MempoolAdmission::Orphaned
            }
            Err(err) => {
                warn!("Transaction {} rejected: {}", tx_id, err);
                MempoolAdmission::Rejected(err)
            }
        }
    }

    fn push_orphan(&mut self, tx: Tx) {
        let tx_id = tx.id();
        if self.orphans.iter().any(|o| o.id() == tx_id) {
            return;
        }
        if self.orphans.len() >= MAX_ORPHAN_TXS {
            let evicted = self.orphans.remove(0);
            debug!("Orphan pool full, evicting {}", evicted.id());
        }
        self.orphans.push(tx);
    }

    // =========================================================================
    // Block Assembly
    // =========================================================================

    /// Fill `block` with mempool transactions in policy order
    pub fn select_for_block(&self, block: &mut Block, utxos: &UtxoSet, max_block_size: usize) {
        let mut candidates: Vec<(u64, String)> = self
            .txs
            .iter()
            .map(|(id, tx)| (calculate_tx_fees(tx, utxos), id.clone()))
            .collect();
        self.policy.order.sort(&mut candidates);

        let mut added: HashSet<String> = block.txs.iter().map(Tx::id).collect();
        let mut spent: HashSet<TxOutPoint> = block
            .txs
            .iter()
            .flat_map(|tx| tx.inputs.iter().filter_map(|txin| txin.to_spend.clone()))
            .collect();

        for (_, tx_id) in &candidates {
            let mut visiting = HashSet::new();
            let mut assembly = Assembly {
                block: &mut *block,
                added: &mut added,
                spent: &mut spent,
                visiting: &mut visiting,
                utxos,
                max_block_size,
            };
            if !self.try_add_to_block(&mut assembly, tx_id) {
                debug!("Transaction {} left out of block", tx_id);
            }
        }
    }

    /// Append `tx_id` after its mempool parents; false if it could not go in
    fn try_add_to_block(&self, asm: &mut Assembly<'_>, tx_id: &str) -> bool {
        if asm.added.contains(tx_id) {
            return true;
        }
        let Some(tx) = self.txs.get(tx_id) else {
            return false;
        };
        if !asm.visiting.insert(tx_id.to_string()) {
            warn!("Dependency cycle through transaction {}", tx_id);
            return false;
        }

        let mut ok = true;
        for txin in &tx.inputs {
            let Some(to_spend) = &txin.to_spend else {
                ok = false;
                break;
            };
            if asm.spent.contains(to_spend) {
                debug!("Transaction {} double-spends {} in block", tx_id, to_spend);
                ok = false;
                break;
            }
            if asm.utxos.contains(to_spend) {
                continue;
            }
            let parent_available = self
                .txs
                .get(&to_spend.tx_id)
                .map(|parent| output_at(parent, to_spend.output_index).is_some())
                .unwrap_or(false);
            if !parent_available {
                debug!("Transaction {} spends unknown output {}", tx_id, to_spend);
                ok = false;
                break;
            }
            if !self.try_add_to_block(asm, &to_spend.tx_id) {
                ok = false;
                break;
            }
        }

        if ok {
            asm.block.txs.push(tx.clone());
            if asm.block.serialized_size() > asm.max_block_size {
                asm.block.txs.pop();
                debug!("Transaction {} does not fit in block", tx_id);
                ok = false;
            } else {
                asm.added.insert(tx_id.to_string());
                asm.spent
                    .extend(tx.inputs.iter().filter_map(|txin| txin.to_spend.clone()));
            }
        }

        asm.visiting.remove(tx_id);
        ok
    }
}

/// Working state of one selection pass
struct Assembly<'a> {
    block: &'a mut Block,
    added: &'a mut HashSet<String>,
    spent: &'a mut HashSet<TxOutPoint>,
    visiting: &'a mut HashSet<String>,
    utxos: &'a UtxoSet,
    max_block_size: usize,
}
