//! P2P boundary
//!
//! The transport itself lives outside this crate. What the node needs from
//! it, and what it offers to it:
//! - `Message`: the closed wire message set with opcode framing
//! - `MessageHandler`: applies decoded messages to the ledger
//! - `PeerNetwork`: outbound broadcast and initial sync requests
//! - `MsgCache`: replies awaited by wallet-style queries

pub mod cache;
pub mod handler;
pub mod message;

pub use cache::{MsgCache, MAX_MSG_AWAIT_TIME_SECS};
pub use handler::{Connection, MessageHandler, INV_CHUNK_SIZE};
pub use message::{Message, NodeType, OpCode};

/// Outbound side of the peer network
pub trait PeerNetwork: Send + Sync {
    /// Ask connected peers for the blocks we are missing
    fn request_initial_sync(&self);
    fn broadcast(&self, message: &Message);
}

/// A node with no peers
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNetwork;

impl PeerNetwork for NullNetwork {
    fn request_initial_sync(&self) {
        log::debug!("No peers to sync from");
    }

    fn broadcast(&self, message: &Message) {
        log::debug!("No peers to receive {}", message.type_name());
    }
}
