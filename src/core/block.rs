//! Block implementation
//!
//! A block is a header committing to its parent, its transactions (by merkle
//! root) and its proof of work, followed by the transaction list. Block
//! identity is the double SHA-256 of the encoded header only, so the miner
//! can re-hash the header per nonce without touching the body.

use crate::core::codec::{BinaryBuffer, CodecError, Decodable, Encodable};
use crate::core::params::{
    ChainParams, GENESIS_ADDRESS, GENESIS_NONCE, GENESIS_REWARD, GENESIS_TIMESTAMP,
};
use crate::core::transaction::{Tx, TxIn, TxOut, COINBASE_SEQUENCE};
use crate::crypto::{compute_root, double_sha256, meets_target};
use serde::{Deserialize, Serialize};

/// Header fields hashed for the block id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u64,
    /// Id of the parent block; empty for genesis
    pub prev_block_hash: String,
    pub merkle_hash: String,
    /// Unix seconds
    pub timestamp: i64,
    /// Proof-of-work exponent: the id must be below `2^(255 - bits)`
    pub bits: u8,
    pub nonce: u64,
}

impl BlockHeader {
    /// Encoded header without the trailing nonce
    pub fn encode_without_nonce(&self) -> Vec<u8> {
        let mut buf = BinaryBuffer::new();
        buf.write_fixed(self.version);
        buf.write_str(&self.prev_block_hash);
        buf.write_str(&self.merkle_hash);
        buf.write_fixed(self.timestamp);
        buf.write_fixed(self.bits);
        buf.into_vec()
    }

    pub fn hash(&self) -> Vec<u8> {
        double_sha256(&self.encode_to_vec())
    }

    pub fn id(&self) -> String {
        hex::encode(self.hash())
    }

    pub fn is_valid_pow(&self) -> bool {
        meets_target(&self.hash(), self.bits)
    }
}

impl Encodable for BlockHeader {
    fn encode(&self, buf: &mut BinaryBuffer) {
        buf.write_raw(&self.encode_without_nonce());
        buf.write_fixed(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            version: buf.read_fixed()?,
            prev_block_hash: buf.read_string()?,
            merkle_hash: buf.read_string()?,
            timestamp: buf.read_fixed()?,
            bits: buf.read_fixed()?,
            nonce: buf.read_fixed()?,
        })
    }
}

/// A block in the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub txs: Vec<Tx>,
}

impl Block {
    pub fn new(
        version: u64,
        prev_block_hash: String,
        timestamp: i64,
        bits: u8,
        nonce: u64,
        txs: Vec<Tx>,
    ) -> Self {
        let merkle_hash = Self::merkle_root_of(&txs);
        Self {
            header: BlockHeader {
                version,
                prev_block_hash,
                merkle_hash,
                timestamp,
                bits,
                nonce,
            },
            txs,
        }
    }

    /// The genesis block of a network
    pub fn genesis(params: &ChainParams) -> Self {
        let txin = TxIn::new(None, Vec::new(), Vec::new(), COINBASE_SEQUENCE);
        let txout = TxOut::new(GENESIS_REWARD, GENESIS_ADDRESS);
        let coinbase = Tx::new(vec![txin], vec![txout], 0);

        Self::new(
            0,
            String::new(),
            GENESIS_TIMESTAMP,
            params.initial_difficulty_bits,
            GENESIS_NONCE,
            vec![coinbase],
        )
    }

    pub fn id(&self) -> String {
        self.header.id()
    }

    pub fn prev_block_hash(&self) -> &str {
        &self.header.prev_block_hash
    }

    /// Merkle root over the ids of `txs`; empty for an empty list
    pub fn merkle_root_of(txs: &[Tx]) -> String {
        let ids: Vec<String> = txs.iter().map(Tx::id).collect();
        compute_root(&ids).map(|root| root.value).unwrap_or_default()
    }

    /// Recompute the merkle root from the current transactions
    pub fn calculate_merkle_hash(&self) -> String {
        Self::merkle_root_of(&self.txs)
    }

    pub fn update_merkle_hash(&mut self) {
        self.header.merkle_hash = self.calculate_merkle_hash();
    }

    pub fn is_valid_pow(&self) -> bool {
        self.header.is_valid_pow()
    }
}

impl Encodable for Block {
    fn encode(&self, buf: &mut BinaryBuffer) {
        self.header.encode(buf);
        buf.write_sized_sequence(&self.txs);
    }
}

impl Decodable for Block {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            header: BlockHeader::decode(buf)?,
            txs: buf.read_sized_sequence()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::TxOutPoint;

    #[test]
    fn test_genesis() {
        let genesis = Block::genesis(&ChainParams::default());
        assert!(genesis.prev_block_hash().is_empty());
        assert_eq!(genesis.header.timestamp, GENESIS_TIMESTAMP);
        assert_eq!(genesis.header.bits, 24);
        assert!(genesis.txs[0].is_coinbase());
        assert_eq!(genesis.header.merkle_hash, genesis.calculate_merkle_hash());
        assert_eq!(genesis.id(), Block::genesis(&ChainParams::default()).id());
    }

    #[test]
    fn test_block_round_trip() {
        let spend = TxIn::new(Some(TxOutPoint::new("00", 1)), vec![9; 64], vec![2; 33], 0);
        let tx = Tx::new(vec![spend], vec![TxOut::new(5, "a"), TxOut::new(0, "")], 0);
        let block = Block::new(
            1,
            "prev".to_string(),
            -3,
            255,
            u64::MAX,
            vec![Tx::create_coinbase("m", 1, 1), tx],
        );
        let decoded = Block::decode_from(&block.encode_to_vec()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.id(), block.id());

        let empty = Block::new(0, String::new(), 0, 0, 0, vec![]);
        assert!(empty.header.merkle_hash.is_empty());
        assert_eq!(Block::decode_from(&empty.encode_to_vec()).unwrap(), empty);
    }

    #[test]
    fn test_binary_and_json_encodings_agree() {
        let block = Block::genesis(&ChainParams::regtest());
        let json = serde_json::to_string(&block).unwrap();
        let from_json: Block = serde_json::from_str(&json).unwrap();

        let bytes = from_json.encode_to_vec();
        assert_eq!(bytes.len(), block.serialized_size());
        assert_eq!(Block::decode_from(&bytes).unwrap(), block);
        assert_eq!(
            BlockHeader::decode_from(&block.header.encode_to_vec()).unwrap(),
            block.header
        );
    }

    #[test]
    fn test_id_covers_header_only() {
        let mut block = Block::new(0, String::new(), 1, 4, 0, vec![Tx::create_coinbase("a", 1, 0)]);
        let id = block.id();
        block.txs.push(Tx::create_coinbase("b", 1, 0));
        assert_eq!(block.id(), id);

        block.header.nonce += 1;
        assert_ne!(block.id(), id);
    }

    #[test]
    fn test_header_prefix_matches_encoding() {
        let block = Block::genesis(&ChainParams::default());
        let mut bytes = block.header.encode_without_nonce();
        bytes.extend_from_slice(&block.header.nonce.to_le_bytes());
        assert_eq!(bytes, block.header.encode_to_vec());
    }

    #[test]
    fn test_pow_check() {
        let mut block = Block::new(0, String::new(), 1, 0, 0, vec![Tx::create_coinbase("a", 1, 0)]);
        // bits 0 accepts about half of all digests
        while !block.is_valid_pow() {
            block.header.nonce += 1;
        }
        assert!(meets_target(&block.header.hash(), 0));
    }
}
