//! Transaction model
//!
//! UTXO-based transactions authorized by ECDSA signatures:
//! - `TxOutPoint` names a spendable output
//! - `TxIn` spends one output point (or none, for a coinbase)
//! - `Tx` identity is the double SHA-256 of its binary encoding

use crate::core::codec::{BinaryBuffer, CodecError, Decodable, Encodable};
use crate::core::params::ChainParams;
use crate::core::utxo::{UnspentTxOut, UtxoSet};
use crate::crypto::{double_sha256, double_sha256_hex, public_key_to_address, verify_signature};
use crate::mining::Mempool;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Sequence number used by coinbase inputs
pub const COINBASE_SEQUENCE: i64 = -1;

// =============================================================================
// Error Types
// =============================================================================

/// Signature or ownership failure; never orphanable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxUnlockError {
    #[error("Public key does not match address {0}")]
    PublicKeyMismatch(String),
    #[error("Signature does not match")]
    SignatureMismatch,
    #[error("Malformed unlock data: {0}")]
    Malformed(String),
}

/// Reasons a transaction is rejected
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TxValidationError {
    #[error("Missing TxOuts or TxIns")]
    MissingInputsOrOutputs,
    #[error("Transaction too large: {0} bytes (max: {1})")]
    TooLarge(usize, usize),
    #[error("Spent value too high")]
    ValueTooHigh,
    #[error("Input {0} has no output to spend")]
    InputWithoutOutPoint(usize),
    #[error("Unable to find any UTXO for {missing}, orphaning transaction")]
    Orphan { missing: TxOutPoint, tx: Box<Tx> },
    #[error("Coinbase UTXO not ready for spending ({confirmations} of {required} confirmations)")]
    ImmatureCoinbase { confirmations: i64, required: i64 },
    #[error("Input {index} not a valid spend of UTXO: {source}")]
    InvalidSpend {
        index: usize,
        #[source]
        source: TxUnlockError,
    },
    #[error("Spent value more than available: {spent} > {available}")]
    Overspend { available: u64, spent: u64 },
    #[error("Output point {0} spent more than once")]
    DoubleSpend(TxOutPoint),
    #[error("Transaction conflicts with mempool transaction {0}")]
    MempoolConflict(String),
}

impl TxValidationError {
    /// The transaction to queue as an orphan, if this error carries one
    pub fn into_orphan(self) -> Option<Tx> {
        match self {
            TxValidationError::Orphan { tx, .. } => Some(*tx),
            _ => None,
        }
    }

    pub fn is_orphan(&self) -> bool {
        matches!(self, TxValidationError::Orphan { .. })
    }
}

// =============================================================================
// Output Point / Output / Input
// =============================================================================

/// Reference to an output of a previous transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxOutPoint {
    pub tx_id: String,
    pub output_index: i64,
}

impl TxOutPoint {
    pub fn new(tx_id: impl Into<String>, output_index: i64) -> Self {
        Self {
            tx_id: tx_id.into(),
            output_index,
        }
    }
}

impl std::fmt::Display for TxOutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.output_index)
    }
}

impl Encodable for TxOutPoint {
    fn encode(&self, buf: &mut BinaryBuffer) {
        buf.write_str(&self.tx_id);
        buf.write_fixed(self.output_index);
    }
}

impl Decodable for TxOutPoint {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            tx_id: buf.read_string()?,
            output_index: buf.read_fixed()?,
        })
    }
}

/// Value locked to an address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxOut {
    /// Amount in minor units
    pub value: u64,
    pub to_address: String,
}

impl TxOut {
    pub fn new(value: u64, to_address: impl Into<String>) -> Self {
        Self {
            value,
            to_address: to_address.into(),
        }
    }
}

impl Encodable for TxOut {
    fn encode(&self, buf: &mut BinaryBuffer) {
        buf.write_fixed(self.value);
        buf.write_str(&self.to_address);
    }
}

impl Decodable for TxOut {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            value: buf.read_fixed()?,
            to_address: buf.read_string()?,
        })
    }
}

/// Transaction input; `to_spend == None` marks a coinbase input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub to_spend: Option<TxOutPoint>,
    pub unlock_sig: Vec<u8>,
    pub unlock_pub_key: Vec<u8>,
    pub sequence: i64,
}

impl TxIn {
    pub fn new(
        to_spend: Option<TxOutPoint>,
        unlock_sig: Vec<u8>,
        unlock_pub_key: Vec<u8>,
        sequence: i64,
    ) -> Self {
        Self {
            to_spend,
            unlock_sig,
            unlock_pub_key,
            sequence,
        }
    }
}

impl Encodable for TxIn {
    fn encode(&self, buf: &mut BinaryBuffer) {
        buf.write_fixed(self.to_spend.is_some());
        if let Some(out_point) = &self.to_spend {
            out_point.encode(buf);
        }
        buf.write_bytes(&self.unlock_sig);
        buf.write_bytes(&self.unlock_pub_key);
        buf.write_fixed(self.sequence);
    }
}

impl Decodable for TxIn {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        let has_to_spend: bool = buf.read_fixed()?;
        let to_spend = if has_to_spend {
            Some(TxOutPoint::decode(buf)?)
        } else {
            None
        };
        Ok(Self {
            to_spend,
            unlock_sig: buf.read_bytes()?,
            unlock_pub_key: buf.read_bytes()?,
            sequence: buf.read_fixed()?,
        })
    }
}

// =============================================================================
// Spend Authorization
// =============================================================================

/// Digest a spender signs: the spent point, its sequence, the spender's
/// public key and every output of the spending transaction
pub fn build_spend_message(
    to_spend: &TxOutPoint,
    pub_key: &[u8],
    sequence: i64,
    outputs: &[TxOut],
) -> Vec<u8> {
    let mut buf = BinaryBuffer::new();
    to_spend.encode(&mut buf);
    buf.write_fixed(sequence);
    buf.write_bytes(pub_key);
    for output in outputs {
        output.encode(&mut buf);
    }
    double_sha256(buf.as_slice())
}

/// Check that `txin` is authorized to spend `utxo`
pub fn validate_signature_for_spend(
    txin: &TxIn,
    utxo: &UnspentTxOut,
    outputs: &[TxOut],
) -> Result<(), TxUnlockError> {
    let pub_key_as_addr = public_key_to_address(&txin.unlock_pub_key)
        .map_err(|e| TxUnlockError::Malformed(e.to_string()))?;
    if pub_key_as_addr != utxo.tx_out.to_address {
        return Err(TxUnlockError::PublicKeyMismatch(
            utxo.tx_out.to_address.clone(),
        ));
    }

    let spend_msg = build_spend_message(
        &utxo.tx_out_point,
        &txin.unlock_pub_key,
        txin.sequence,
        outputs,
    );
    match verify_signature(&txin.unlock_pub_key, &spend_msg, &txin.unlock_sig) {
        Ok(true) => Ok(()),
        Ok(false) => Err(TxUnlockError::SignatureMismatch),
        Err(e) => Err(TxUnlockError::Malformed(e.to_string())),
    }
}

// =============================================================================
// Validation Inputs
// =============================================================================

/// Ledger state a transaction is validated against
pub struct ValidationContext<'a> {
    pub utxos: &'a UtxoSet,
    /// Consulted only when the request allows it
    pub mempool: Option<&'a Mempool>,
    /// Number of blocks in the active chain
    pub current_height: i64,
    pub params: &'a ChainParams,
}

/// Per-call validation options
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateRequest<'a> {
    /// Other transactions of the same candidate block
    pub siblings_in_block: &'a [Tx],
    pub allow_utxo_from_mempool: bool,
    pub as_coinbase: bool,
}

// =============================================================================
// Transaction
// =============================================================================

/// A value transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: i64,
}

impl Tx {
    pub fn new(inputs: Vec<TxIn>, outputs: Vec<TxOut>, lock_time: i64) -> Self {
        Self {
            inputs,
            outputs,
            lock_time,
        }
    }

    /// Hex double SHA-256 of the encoded transaction
    pub fn id(&self) -> String {
        double_sha256_hex(&self.encode_to_vec())
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].to_spend.is_none()
    }

    /// Block reward transaction; the height in the unlock field keeps
    /// coinbase ids unique across blocks
    pub fn create_coinbase(pay_to_address: &str, value: u64, height: i64) -> Self {
        let mut unlock_sig = BinaryBuffer::new();
        unlock_sig.write_fixed(height);

        let txin = TxIn::new(None, unlock_sig.into_vec(), Vec::new(), COINBASE_SEQUENCE);
        let txout = TxOut::new(value, pay_to_address);
        Self::new(vec![txin], vec![txout], 0)
    }

    /// Sum of output values, `None` on overflow
    pub fn output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }

    /// Context-free checks
    pub fn validate_basics(
        &self,
        as_coinbase: bool,
        params: &ChainParams,
    ) -> Result<(), TxValidationError> {
        if self.outputs.is_empty() || (self.inputs.is_empty() && !as_coinbase) {
            return Err(TxValidationError::MissingInputsOrOutputs);
        }

        let size = self.serialized_size();
        if size > params.max_block_serialized_size {
            return Err(TxValidationError::TooLarge(
                size,
                params.max_block_serialized_size,
            ));
        }

        match self.output_value() {
            Some(total) if total <= params.max_money => Ok(()),
            _ => Err(TxValidationError::ValueTooHigh),
        }
    }

    /// Resolve every input and check maturity, signatures and value
    ///
    /// Inputs resolve against the UTXO index, then the sibling transactions
    /// of the request, then (if allowed) the mempool.
    pub fn validate(
        &self,
        ctx: &ValidationContext<'_>,
        req: &ValidateRequest<'_>,
    ) -> Result<(), TxValidationError> {
        self.validate_basics(req.as_coinbase, ctx.params)?;

        let mut seen = std::collections::HashSet::new();
        for point in self.inputs.iter().filter_map(|txin| txin.to_spend.as_ref()) {
            if !seen.insert(point) {
                return Err(TxValidationError::DoubleSpend(point.clone()));
            }
        }

        let mut available: u64 = 0;
        for (index, txin) in self.inputs.iter().enumerate() {
            let out_point = txin
                .to_spend
                .as_ref()
                .ok_or(TxValidationError::InputWithoutOutPoint(index))?;

            let utxo = ctx
                .utxos
                .find(out_point)
                .cloned()
                .or_else(|| UtxoSet::find_in_list(txin, req.siblings_in_block))
                .or_else(|| match ctx.mempool {
                    Some(mempool) if req.allow_utxo_from_mempool => {
                        mempool.find_utxo_in_mempool(out_point)
                    }
                    _ => None,
                });

            let utxo = utxo.ok_or_else(|| TxValidationError::Orphan {
                missing: out_point.clone(),
                tx: Box::new(self.clone()),
            })?;

            if utxo.is_coinbase {
                let confirmations = ctx.current_height - utxo.height;
                if confirmations < ctx.params.coinbase_maturity {
                    return Err(TxValidationError::ImmatureCoinbase {
                        confirmations,
                        required: ctx.params.coinbase_maturity,
                    });
                }
            }

            validate_signature_for_spend(txin, &utxo, &self.outputs).map_err(|source| {
                log::debug!("Tx {} input {} rejected: {}", self.id(), index, source);
                TxValidationError::InvalidSpend { index, source }
            })?;

            available = available
                .checked_add(utxo.tx_out.value)
                .ok_or(TxValidationError::ValueTooHigh)?;
        }

        let spent = self.output_value().ok_or(TxValidationError::ValueTooHigh)?;
        if available < spent {
            return Err(TxValidationError::Overspend { available, spent });
        }

        Ok(())
    }
}

impl Encodable for Tx {
    fn encode(&self, buf: &mut BinaryBuffer) {
        buf.write_sized_sequence(&self.inputs);
        buf.write_sized_sequence(&self.outputs);
        buf.write_fixed(self.lock_time);
    }
}

impl Decodable for Tx {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            inputs: buf.read_sized_sequence()?,
            outputs: buf.read_sized_sequence()?,
            lock_time: buf.read_fixed()?,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::test_utils::signed_spend;

    fn context<'a>(utxos: &'a UtxoSet, params: &'a ChainParams, height: i64) -> ValidationContext<'a> {
        ValidationContext {
            utxos,
            mempool: None,
            current_height: height,
            params,
        }
    }

    #[test]
    fn test_round_trip_edge_cases() {
        let point = TxOutPoint::new("", -1);
        assert_eq!(TxOutPoint::decode_from(&point.encode_to_vec()).unwrap(), point);

        let out = TxOut::new(u64::MAX, "");
        assert_eq!(TxOut::decode_from(&out.encode_to_vec()).unwrap(), out);

        let coinbase_in = TxIn::new(None, vec![], vec![], -1);
        assert_eq!(TxIn::decode_from(&coinbase_in.encode_to_vec()).unwrap(), coinbase_in);

        let spend_in = TxIn::new(Some(TxOutPoint::new("ab", 3)), vec![1, 2], vec![3], 7);
        assert_eq!(TxIn::decode_from(&spend_in.encode_to_vec()).unwrap(), spend_in);

        let tx = Tx::new(vec![spend_in, coinbase_in], vec![out], -5);
        assert_eq!(Tx::decode_from(&tx.encode_to_vec()).unwrap(), tx);
    }

    #[test]
    fn test_truncated_tx_fails() {
        let tx = Tx::create_coinbase("addr", 50, 1);
        let bytes = tx.encode_to_vec();
        assert!(Tx::decode_from(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_coinbase() {
        let a = Tx::create_coinbase("addr", 50, 1);
        let b = Tx::create_coinbase("addr", 50, 2);
        assert!(a.is_coinbase());
        assert_eq!(a.inputs[0].unlock_sig, 1i64.to_le_bytes().to_vec());
        assert_eq!(a.inputs[0].sequence, -1);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id().len(), 64);
    }

    #[test]
    fn test_validate_basics() {
        let params = ChainParams::default();

        let no_outputs = Tx::new(vec![], vec![], 0);
        assert_eq!(
            no_outputs.validate_basics(true, &params),
            Err(TxValidationError::MissingInputsOrOutputs)
        );

        let no_inputs = Tx::new(vec![], vec![TxOut::new(1, "a")], 0);
        assert!(no_inputs.validate_basics(true, &params).is_ok());
        assert!(no_inputs.validate_basics(false, &params).is_err());

        let too_rich = Tx::create_coinbase("a", params.max_money + 1, 0);
        assert_eq!(
            too_rich.validate_basics(true, &params),
            Err(TxValidationError::ValueTooHigh)
        );
    }

    #[test]
    fn test_validate_spend() {
        let params = ChainParams::default();
        let kp = KeyPair::generate();
        let mut utxos = UtxoSet::new();
        utxos.add(TxOut::new(1_000, kp.address()), "funding", 0, false, 1);

        let tx = signed_spend(&kp, TxOutPoint::new("funding", 0), vec![TxOut::new(900, "bob")]);
        assert!(tx.validate(&context(&utxos, &params, 5), &ValidateRequest::default()).is_ok());

        let greedy = signed_spend(&kp, TxOutPoint::new("funding", 0), vec![TxOut::new(1_001, "bob")]);
        assert!(matches!(
            greedy.validate(&context(&utxos, &params, 5), &ValidateRequest::default()),
            Err(TxValidationError::Overspend { .. })
        ));
    }

    #[test]
    fn test_wrong_key_is_unlock_error() {
        let params = ChainParams::default();
        let owner = KeyPair::generate();
        let thief = KeyPair::generate();
        let mut utxos = UtxoSet::new();
        utxos.add(TxOut::new(1_000, owner.address()), "funding", 0, false, 1);

        let tx = signed_spend(&thief, TxOutPoint::new("funding", 0), vec![TxOut::new(10, "x")]);
        let err = tx
            .validate(&context(&utxos, &params, 5), &ValidateRequest::default())
            .unwrap_err();
        assert!(matches!(
            err,
            TxValidationError::InvalidSpend {
                source: TxUnlockError::PublicKeyMismatch(_),
                ..
            }
        ));
        assert!(err.into_orphan().is_none());
    }

    #[test]
    fn test_tampered_outputs_fail_signature() {
        let params = ChainParams::default();
        let kp = KeyPair::generate();
        let mut utxos = UtxoSet::new();
        utxos.add(TxOut::new(1_000, kp.address()), "funding", 0, false, 1);

        let mut tx = signed_spend(&kp, TxOutPoint::new("funding", 0), vec![TxOut::new(10, "x")]);
        tx.outputs[0].to_address = "mallory".to_string();
        assert!(matches!(
            tx.validate(&context(&utxos, &params, 5), &ValidateRequest::default()),
            Err(TxValidationError::InvalidSpend {
                source: TxUnlockError::SignatureMismatch,
                ..
            })
        ));
    }

    #[test]
    fn test_missing_utxo_is_orphan() {
        let params = ChainParams::default();
        let kp = KeyPair::generate();
        let utxos = UtxoSet::new();

        let tx = signed_spend(&kp, TxOutPoint::new("unknown", 0), vec![TxOut::new(1, "x")]);
        let err = tx
            .validate(&context(&utxos, &params, 5), &ValidateRequest::default())
            .unwrap_err();
        assert_eq!(err.into_orphan(), Some(tx));
    }

    #[test]
    fn test_sibling_resolution() {
        let params = ChainParams::default();
        let kp = KeyPair::generate();
        let mut utxos = UtxoSet::new();
        utxos.add(TxOut::new(1_000, kp.address()), "funding", 0, false, 1);

        let parent = signed_spend(&kp, TxOutPoint::new("funding", 0), vec![TxOut::new(900, kp.address())]);
        let child = signed_spend(&kp, TxOutPoint::new(parent.id(), 0), vec![TxOut::new(800, "bob")]);

        let siblings = vec![parent];
        let req = ValidateRequest {
            siblings_in_block: &siblings,
            ..Default::default()
        };
        assert!(child.validate(&context(&utxos, &params, 5), &req).is_ok());
    }

    #[test]
    fn test_coinbase_maturity() {
        let params = ChainParams::default();
        let kp = KeyPair::generate();
        let mut utxos = UtxoSet::new();
        utxos.add(TxOut::new(1_000, kp.address()), "reward", 0, true, 3);

        let tx = signed_spend(&kp, TxOutPoint::new("reward", 0), vec![TxOut::new(10, "x")]);
        let req = ValidateRequest::default();

        for height in 3..5 {
            assert!(matches!(
                tx.validate(&context(&utxos, &params, height), &req),
                Err(TxValidationError::ImmatureCoinbase { .. })
            ));
        }
        assert!(tx.validate(&context(&utxos, &params, 5), &req).is_ok());
    }
}
