//! Network message types for P2P communication
//!
//! Every message travels as `[opcode: u8][payload]`, the payload being the
//! binary encoding of the entity the message carries. The message set is
//! closed: decoding dispatches on the opcode with one exhaustive match.

use crate::core::{
    BinaryBuffer, Block, CodecError, Decodable, Encodable, Tx, TxOutPoint, UnspentTxOut,
};
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Roles a peer announces in its hello
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct NodeType: u8 {
        const MINER = 1;
        const WALLET = 1 << 1;
        const FULL = Self::MINER.bits() | Self::WALLET.bits();
    }
}

/// Wire identifier of each message kind
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    BlockInfo = 0,
    GetActiveChain = 1,
    GetBlock = 2,
    GetMempool = 3,
    GetUtxos = 4,
    Inv = 5,
    PeerAdd = 6,
    PeerHello = 7,
    SendActiveChain = 8,
    SendMempool = 9,
    SendUtxos = 10,
    TxInfo = 11,
}

impl TryFrom<u8> for OpCode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => OpCode::BlockInfo,
            1 => OpCode::GetActiveChain,
            2 => OpCode::GetBlock,
            3 => OpCode::GetMempool,
            4 => OpCode::GetUtxos,
            5 => OpCode::Inv,
            6 => OpCode::PeerAdd,
            7 => OpCode::PeerHello,
            8 => OpCode::SendActiveChain,
            9 => OpCode::SendMempool,
            10 => OpCode::SendUtxos,
            11 => OpCode::TxInfo,
            other => return Err(CodecError::UnknownOpCode(other)),
        })
    }
}

/// Network message types
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Announce a block
    BlockInfo(Block),
    GetActiveChain,
    /// Ask for active-chain blocks starting at a known block
    GetBlock { from_block_id: String },
    GetMempool,
    GetUtxos,
    /// A run of active-chain blocks, answering `GetBlock`
    Inv(Vec<Block>),
    /// Ask the receiver to connect to another peer
    PeerAdd { host: String, port: u16 },
    PeerHello { node_type: NodeType },
    SendActiveChain(Vec<Block>),
    /// Ids of the sender's mempool transactions
    SendMempool(Vec<String>),
    SendUtxos(Vec<(TxOutPoint, UnspentTxOut)>),
    /// Announce a transaction
    TxInfo(Tx),
}

impl Message {
    pub fn op_code(&self) -> OpCode {
        match self {
            Message::BlockInfo(_) => OpCode::BlockInfo,
            Message::GetActiveChain => OpCode::GetActiveChain,
            Message::GetBlock { .. } => OpCode::GetBlock,
            Message::GetMempool => OpCode::GetMempool,
            Message::GetUtxos => OpCode::GetUtxos,
            Message::Inv(_) => OpCode::Inv,
            Message::PeerAdd { .. } => OpCode::PeerAdd,
            Message::PeerHello { .. } => OpCode::PeerHello,
            Message::SendActiveChain(_) => OpCode::SendActiveChain,
            Message::SendMempool(_) => OpCode::SendMempool,
            Message::SendUtxos(_) => OpCode::SendUtxos,
            Message::TxInfo(_) => OpCode::TxInfo,
        }
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self.op_code() {
            OpCode::BlockInfo => "BlockInfo",
            OpCode::GetActiveChain => "GetActiveChain",
            OpCode::GetBlock => "GetBlock",
            OpCode::GetMempool => "GetMempool",
            OpCode::GetUtxos => "GetUtxos",
            OpCode::Inv => "Inv",
            OpCode::PeerAdd => "PeerAdd",
            OpCode::PeerHello => "PeerHello",
            OpCode::SendActiveChain => "SendActiveChain",
            OpCode::SendMempool => "SendMempool",
            OpCode::SendUtxos => "SendUtxos",
            OpCode::TxInfo => "TxInfo",
        }
    }

    /// Opcode followed by the payload
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BinaryBuffer::new();
        buf.write_fixed(self.op_code() as u8);
        self.encode_payload(&mut buf);
        buf.into_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut buf = BinaryBuffer::from_bytes(bytes);
        let op_code = OpCode::try_from(buf.read_fixed::<u8>()?)?;
        Self::decode_payload(op_code, &mut buf)
    }

    fn encode_payload(&self, buf: &mut BinaryBuffer) {
        match self {
            Message::BlockInfo(block) => block.encode(buf),
            Message::GetActiveChain | Message::GetMempool | Message::GetUtxos => {}
            Message::GetBlock { from_block_id } => buf.write_str(from_block_id),
            Message::Inv(blocks) | Message::SendActiveChain(blocks) => {
                buf.write_sized_sequence(blocks)
            }
            Message::PeerAdd { host, port } => {
                buf.write_str(host);
                buf.write_fixed(*port);
            }
            Message::PeerHello { node_type } => buf.write_fixed(node_type.bits()),
            Message::SendMempool(tx_ids) => buf.write_sized_sequence(tx_ids),
            Message::SendUtxos(utxos) => {
                buf.write_size(utxos.len());
                for (out_point, utxo) in utxos {
                    out_point.encode(buf);
                    utxo.encode(buf);
                }
            }
            Message::TxInfo(tx) => tx.encode(buf),
        }
    }

    fn decode_payload(op_code: OpCode, buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        Ok(match op_code {
            OpCode::BlockInfo => Message::BlockInfo(Block::decode(buf)?),
            OpCode::GetActiveChain => Message::GetActiveChain,
            OpCode::GetBlock => Message::GetBlock {
                from_block_id: buf.read_string()?,
            },
            OpCode::GetMempool => Message::GetMempool,
            OpCode::GetUtxos => Message::GetUtxos,
            OpCode::Inv => Message::Inv(buf.read_sized_sequence()?),
            OpCode::PeerAdd => Message::PeerAdd {
                host: buf.read_string()?,
                port: buf.read_fixed()?,
            },
            OpCode::PeerHello => Message::PeerHello {
                node_type: NodeType::from_bits_truncate(buf.read_fixed()?),
            },
            OpCode::SendActiveChain => Message::SendActiveChain(buf.read_sized_sequence()?),
            OpCode::SendMempool => Message::SendMempool(buf.read_sized_sequence()?),
            OpCode::SendUtxos => {
                let count = buf.read_size()?;
                let mut utxos = Vec::with_capacity(count.min(buf.remaining()));
                for _ in 0..count {
                    let out_point = TxOutPoint::decode(buf)?;
                    let utxo = UnspentTxOut::decode(buf)?;
                    utxos.push((out_point, utxo));
                }
                Message::SendUtxos(utxos)
            }
            OpCode::TxInfo => Message::TxInfo(Tx::decode(buf)?),
        })
    }
}
