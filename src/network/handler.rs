//! Message handlers
//!
//! Each decoded message is applied to the shared ledger against the
//! connection it arrived on. Malformed input is logged and dropped.

use crate::core::{Block, LedgerState};
use crate::network::cache::MsgCache;
use crate::network::message::{Message, NodeType};
use crate::network::PeerNetwork;
use crate::storage::Storage;
use log::{debug, info, warn};
use std::sync::Arc;

/// Blocks sent per `Inv` reply
pub const INV_CHUNK_SIZE: usize = 50;

/// The peer a message came from
pub trait Connection {
    fn remote_addr(&self) -> String;
    fn send(&self, message: &Message);
    fn set_node_type(&self, node_type: NodeType);
    /// Open a connection to another peer
    fn connect_peer(&self, host: &str, port: u16);
}

/// Applies incoming messages to a node's ledger
pub struct MessageHandler {
    ledger: Arc<LedgerState>,
    storage: Option<Arc<Storage>>,
    network: Arc<dyn PeerNetwork>,
    cache: Arc<MsgCache>,
}

impl MessageHandler {
    pub fn new(
        ledger: Arc<LedgerState>,
        storage: Option<Arc<Storage>>,
        network: Arc<dyn PeerNetwork>,
        cache: Arc<MsgCache>,
    ) -> Self {
        Self {
            ledger,
            storage,
            network,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<MsgCache> {
        &self.cache
    }

    /// Decode and handle a raw message; `false` if it could not be decoded
    pub fn handle_bytes(&self, bytes: &[u8], conn: &dyn Connection) -> bool {
        match Message::from_bytes(bytes) {
            Ok(message) => {
                self.handle(message, conn);
                true
            }
            Err(e) => {
                debug!("Dropping malformed message from {}: {}", conn.remote_addr(), e);
                false
            }
        }
    }

    pub fn handle(&self, message: Message, conn: &dyn Connection) {
        debug!("Received {} from {}", message.type_name(), conn.remote_addr());

        match message {
            Message::BlockInfo(block) => self.on_block(block),
            Message::TxInfo(tx) => {
                let tx_id = tx.id();
                if self.ledger.add_tx_to_mempool(tx.clone()).is_accepted() {
                    debug!("Relaying transaction {}", tx_id);
                    self.network.broadcast(&Message::TxInfo(tx));
                }
            }
            Message::GetBlock { from_block_id } => {
                conn.send(&Message::Inv(self.blocks_from(&from_block_id)));
            }
            Message::Inv(blocks) => self.on_inv(blocks, conn),
            Message::GetActiveChain => {
                conn.send(&Message::SendActiveChain(self.ledger.active_chain()));
            }
            Message::GetMempool => {
                conn.send(&Message::SendMempool(self.ledger.mempool_tx_ids()));
            }
            Message::GetUtxos => {
                let mut utxos: Vec<_> = self
                    .ledger
                    .utxos_snapshot()
                    .iter()
                    .map(|utxo| (utxo.tx_out_point.clone(), utxo.clone()))
                    .collect();
                utxos.sort_by(|a, b| a.0.cmp(&b.0));
                conn.send(&Message::SendUtxos(utxos));
            }
            Message::PeerAdd { host, port } => conn.connect_peer(&host, port),
            Message::PeerHello { node_type } => conn.set_node_type(node_type),
            Message::SendActiveChain(blocks) => self.cache.store_active_chain(blocks),
            Message::SendMempool(tx_ids) => self.cache.store_mempool(tx_ids),
            Message::SendUtxos(utxos) => self.cache.store_utxos(utxos),
        }
    }

    fn save(&self) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save_chain(&self.ledger) {
                warn!("Failed to save chain: {}", e);
            }
        }
    }

    fn on_block(&self, block: Block) {
        debug!("Received block {}", block.id());
        if self.ledger.connect_block(block).is_some() {
            self.save();
        }
    }

    /// Active-chain blocks from the requested block onward, or from height 1
    /// if it is unknown
    fn blocks_from(&self, from_block_id: &str) -> Vec<Block> {
        let guard = self.ledger.lock();
        let chain = guard.chain();
        let start = chain
            .locate_block_in_active_chain(from_block_id)
            .map_or(1, |(_, height)| height);

        chain
            .active_chain()
            .iter()
            .skip(start)
            .take(INV_CHUNK_SIZE)
            .cloned()
            .collect()
    }

    fn on_inv(&self, blocks: Vec<Block>, conn: &dyn Connection) {
        info!("Received initial sync from {}", conn.remote_addr());

        let new_blocks: Vec<Block> = {
            let guard = self.ledger.lock();
            blocks
                .into_iter()
                .filter(|block| !guard.chain().contains_block(&block.id(), false))
                .collect()
        };

        if new_blocks.is_empty() {
            info!("Initial block download complete");
            self.ledger.set_initial_sync_complete(true);
            self.save();
            return;
        }

        for block in new_blocks {
            self.ledger.connect_block(block);
        }

        let tip_id = self.ledger.tip_id();
        info!("Continuing initial sync from {}", tip_id);
        conn.send(&Message::GetBlock {
            from_block_id: tip_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ChainParams;
    use crate::network::NullNetwork;
    use crate::test_utils::next_block;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingConnection {
        sent: Mutex<Vec<Message>>,
        node_type: Mutex<Option<NodeType>>,
        peers: Mutex<Vec<(String, u16)>>,
    }

    impl Connection for RecordingConnection {
        fn remote_addr(&self) -> String {
            "test-peer".to_string()
        }

        fn send(&self, message: &Message) {
            self.sent.lock().unwrap().push(message.clone());
        }

        fn set_node_type(&self, node_type: NodeType) {
            *self.node_type.lock().unwrap() = Some(node_type);
        }

        fn connect_peer(&self, host: &str, port: u16) {
            self.peers.lock().unwrap().push((host.to_string(), port));
        }
    }

    fn handler_for(ledger: &Arc<LedgerState>) -> MessageHandler {
        MessageHandler::new(
            Arc::clone(ledger),
            None,
            Arc::new(NullNetwork),
            Arc::new(MsgCache::new()),
        )
    }

    fn mined_ledger(blocks: i64) -> Arc<LedgerState> {
        let ledger = Arc::new(LedgerState::new(ChainParams::regtest()));
        for i in 1..=blocks {
            let block = next_block(&ledger, "miner", i);
            ledger.connect_block(block);
        }
        ledger
    }

    #[test]
    fn test_get_block_replies_with_inv() {
        let ledger = mined_ledger(3);
        let handler = handler_for(&ledger);
        let conn = RecordingConnection::default();

        handler.handle(
            Message::GetBlock {
                from_block_id: "unknown".to_string(),
            },
            &conn,
        );
        let tip = ledger.tip_id();
        handler.handle(Message::GetBlock { from_block_id: tip.clone() }, &conn);

        let sent = conn.sent.lock().unwrap();
        match &sent[0] {
            Message::Inv(blocks) => assert_eq!(blocks.len(), 3),
            other => panic!("unexpected reply {:?}", other),
        }
        match &sent[1] {
            Message::Inv(blocks) => {
                assert_eq!(blocks.len(), 1);
                assert_eq!(blocks[0].id(), tip);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_initial_sync_through_inv() {
        let source = mined_ledger(3);
        let ledger = Arc::new(LedgerState::new(ChainParams::regtest()));
        let handler = handler_for(&ledger);
        let conn = RecordingConnection::default();

        let blocks = source.active_chain().split_off(1);
        handler.handle(Message::Inv(blocks), &conn);
        assert_eq!(ledger.tip_id(), source.tip_id());
        assert!(!ledger.is_initial_sync_complete());
        assert_eq!(
            conn.sent.lock().unwrap().last(),
            Some(&Message::GetBlock {
                from_block_id: source.tip_id()
            })
        );

        handler.handle(Message::Inv(vec![source.tip()]), &conn);
        assert!(ledger.is_initial_sync_complete());
    }

    #[test]
    fn test_block_and_tx_info() {
        let source = mined_ledger(1);
        let ledger = Arc::new(LedgerState::new(ChainParams::regtest()));
        let handler = handler_for(&ledger);
        let conn = RecordingConnection::default();

        assert!(handler.handle_bytes(&Message::BlockInfo(source.tip()).to_bytes(), &conn));
        assert_eq!(ledger.tip_id(), source.tip_id());
        assert!(!handler.handle_bytes(&[200, 1, 2], &conn));
    }

    #[test]
    fn test_queries_and_replies() {
        let ledger = mined_ledger(1);
        let handler = handler_for(&ledger);
        let conn = RecordingConnection::default();

        handler.handle(Message::GetUtxos, &conn);
        handler.handle(Message::GetMempool, &conn);
        handler.handle(Message::GetActiveChain, &conn);
        {
            let sent = conn.sent.lock().unwrap();
            assert!(matches!(&sent[0], Message::SendUtxos(utxos) if utxos.len() == 2));
            assert!(matches!(&sent[1], Message::SendMempool(ids) if ids.is_empty()));
            assert!(matches!(&sent[2], Message::SendActiveChain(blocks) if blocks.len() == 2));
        }

        handler.handle(Message::SendMempool(vec!["x".to_string()]), &conn);
        assert_eq!(handler.cache().take_mempool(), Some(vec!["x".to_string()]));
    }

    #[test]
    fn test_peer_messages() {
        let ledger = mined_ledger(0);
        let handler = handler_for(&ledger);
        let conn = RecordingConnection::default();

        handler.handle(
            Message::PeerHello {
                node_type: NodeType::MINER,
            },
            &conn,
        );
        handler.handle(
            Message::PeerAdd {
                host: "10.0.0.1".to_string(),
                port: 9999,
            },
            &conn,
        );

        assert_eq!(*conn.node_type.lock().unwrap(), Some(NodeType::MINER));
        assert_eq!(conn.peers.lock().unwrap().as_slice(), &[("10.0.0.1".to_string(), 9999)]);
    }
}
