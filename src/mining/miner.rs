//! Mining engine
//!
//! Builds a block template on the active tip under the ledger lock, then
//! searches the nonce space on a pool of scoped threads with no lock held.
//! Workers poll three shared atomics after every hash:
//! - `found`, set by the first worker with a solution
//! - the ledger's mine interrupt, set whenever the active tip changes
//! - the end of their own nonce chunk

use crate::core::{Block, Encodable, LedgerState, Tx};
use crate::crypto::{double_sha256, meets_target};
use crate::mining::pow::{block_subsidy, calculate_fees, next_required_difficulty};
use crate::network::{Message, PeerNetwork};
use crate::storage::{Storage, StorageError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Hashes a worker performs between updates of the shared counter
const HASH_COUNT_BATCH: u64 = 4_096;

#[derive(Error, Debug)]
pub enum MiningError {
    #[error("Assembled block too large: {0} bytes (max: {1})")]
    BlockTooLarge(usize, usize),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Mining statistics
#[derive(Debug, Clone, Default)]
pub struct MiningStats {
    /// Number of hash attempts
    pub hash_attempts: u64,
    /// Time taken in milliseconds
    pub time_ms: u128,
    /// Hash rate (hashes per second)
    pub hash_rate: f64,
}

impl MiningStats {
    fn new(hash_attempts: u64, time_ms: u128) -> Self {
        let hash_rate = if time_ms > 0 {
            (hash_attempts as f64) / (time_ms as f64 / 1000.0)
        } else {
            hash_attempts as f64
        };
        Self {
            hash_attempts,
            time_ms,
            hash_rate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    /// Cores left free for the rest of the node
    pub reserved_threads: usize,
    /// Longest wait for initial block download before mining starts
    pub initial_sync_wait_secs: u64,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            reserved_threads: 2,
            initial_sync_wait_secs: 60,
        }
    }
}

impl MinerConfig {
    pub fn worker_count(&self) -> usize {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .saturating_sub(self.reserved_threads)
            .max(1)
    }
}

// =============================================================================
// Nonce Search
// =============================================================================

struct SearchState<'a> {
    prefix: &'a [u8],
    bits: u8,
    found: AtomicBool,
    found_nonce: AtomicU64,
    hash_count: AtomicU64,
    interrupt: &'a AtomicBool,
}

impl SearchState<'_> {
    /// Scan `start..=end`
    fn mine_chunk(&self, start: u64, end: u64) {
        let mut header = Vec::with_capacity(self.prefix.len() + 8);
        let mut unflushed = 0u64;
        let mut nonce = start;

        loop {
            if self.found.load(Ordering::Relaxed) || self.interrupt.load(Ordering::Relaxed) {
                break;
            }

            header.clear();
            header.extend_from_slice(self.prefix);
            header.extend_from_slice(&nonce.to_le_bytes());
            unflushed += 1;

            if meets_target(&double_sha256(&header), self.bits) {
                if self
                    .found
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.found_nonce.store(nonce, Ordering::SeqCst);
                }
                break;
            }

            if unflushed == HASH_COUNT_BATCH {
                self.hash_count.fetch_add(unflushed, Ordering::Relaxed);
                unflushed = 0;
            }
            if nonce == end {
                break;
            }
            nonce += 1;
        }

        self.hash_count.fetch_add(unflushed, Ordering::Relaxed);
    }
}

/// Split `[0, u64::MAX]` into `workers` contiguous inclusive ranges
fn nonce_chunks(workers: usize) -> Vec<(u64, u64)> {
    let workers = workers.max(1) as u64;
    let chunk = u64::MAX / workers;
    (0..workers)
        .map(|i| {
            let start = i * chunk;
            let end = if i == workers - 1 {
                u64::MAX
            } else {
                start + chunk - 1
            };
            (start, end)
        })
        .collect()
}

/// Search for a nonce satisfying the block's bits
///
/// Clears `interrupt` first; returns `None` if it is raised again while
/// searching, or if the nonce space runs out.
pub fn mine(block: &Block, interrupt: &AtomicBool, workers: usize) -> (Option<Block>, MiningStats) {
    interrupt.store(false, Ordering::SeqCst);

    let mut block = block.clone();
    block.header.nonce = 0;
    let prefix = block.header.encode_without_nonce();
    let state = SearchState {
        prefix: &prefix,
        bits: block.header.bits,
        found: AtomicBool::new(false),
        found_nonce: AtomicU64::new(0),
        hash_count: AtomicU64::new(0),
        interrupt,
    };

    let chunks = nonce_chunks(workers);
    debug!("Mining with {} workers at bits {}", chunks.len(), state.bits);

    let start = Instant::now();
    thread::scope(|scope| {
        for &(first, last) in &chunks {
            let state = &state;
            scope.spawn(move || state.mine_chunk(first, last));
        }
    });

    let stats = MiningStats::new(
        state.hash_count.load(Ordering::SeqCst),
        start.elapsed().as_millis(),
    );

    if interrupt.load(Ordering::SeqCst) {
        interrupt.store(false, Ordering::SeqCst);
        info!("Mining interrupted after {} attempts", stats.hash_attempts);
        return (None, stats);
    }

    if !state.found.load(Ordering::SeqCst) {
        warn!("Nonce space exhausted without a solution");
        return (None, stats);
    }

    block.header.nonce = state.found_nonce.load(Ordering::SeqCst);
    info!(
        "Block {} mined in {}ms ({} attempts, {:.2} H/s)",
        block.id(),
        stats.time_ms,
        stats.hash_attempts,
        stats.hash_rate
    );
    (Some(block), stats)
}

// =============================================================================
// Miner
// =============================================================================

/// Block producer bound to one ledger
pub struct Miner {
    ledger: Arc<LedgerState>,
    config: MinerConfig,
    shutdown: Arc<AtomicBool>,
}

impl Miner {
    pub fn new(ledger: Arc<LedgerState>, config: MinerConfig) -> Self {
        Self {
            ledger,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops `mine_forever` and `mine_blocks` after the current block
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.ledger.mine_interrupt().store(true, Ordering::SeqCst);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Build a block template on the active tip
    ///
    /// Without explicit transactions the mempool fills the block. The
    /// coinbase pays subsidy plus fees to `pay_to`.
    pub fn assemble_block(&self, pay_to: &str, txs: Option<Vec<Tx>>) -> Result<Block, MiningError> {
        let guard = self.ledger.lock();
        let params = guard.params();
        let chain = guard.chain();

        let tip_id = chain.tip().id();
        let bits = next_required_difficulty(chain, params, &tip_id);
        let median = chain.median_time_past(params.median_time_past_blocks);
        let timestamp = chrono::Utc::now().timestamp().max(median + 1);

        let fill_from_mempool = txs.is_none();
        let mut block = Block::new(0, tip_id, timestamp, bits, 0, txs.unwrap_or_default());
        if fill_from_mempool {
            guard
                .mempool()
                .select_for_block(&mut block, guard.utxos(), params.max_block_serialized_size);
        }

        let height = chain.height() as i64;
        let fees = calculate_fees(&block, guard.utxos());
        let reward = block_subsidy(params, height).saturating_add(fees);
        block.txs.insert(0, Tx::create_coinbase(pay_to, reward, height));
        block.update_merkle_hash();

        let size = block.serialized_size();
        if size > params.max_block_serialized_size {
            return Err(MiningError::BlockTooLarge(size, params.max_block_serialized_size));
        }

        info!(
            "Assembled block at height {} with {} transactions ({} fees)",
            height,
            block.txs.len(),
            fees
        );
        Ok(block)
    }

    pub fn mine(&self, block: &Block) -> (Option<Block>, MiningStats) {
        mine(block, self.ledger.mine_interrupt(), self.config.worker_count())
    }

    pub fn assemble_and_solve_block(
        &self,
        pay_to: &str,
        txs: Option<Vec<Tx>>,
    ) -> Result<Option<(Block, MiningStats)>, MiningError> {
        let block = self.assemble_block(pay_to, txs)?;
        let (solved, stats) = self.mine(&block);
        Ok(solved.map(|block| (block, stats)))
    }

    /// Mine, connect, persist and announce one block; `None` if mining was
    /// interrupted or the block did not connect
    fn mine_and_connect(
        &self,
        pay_to: &str,
        storage: Option<&Storage>,
        network: &dyn PeerNetwork,
    ) -> Result<Option<(Block, MiningStats)>, MiningError> {
        let Some((block, stats)) = self.assemble_and_solve_block(pay_to, None)? else {
            return Ok(None);
        };

        if self.ledger.connect_block(block.clone()).is_none() {
            warn!("Mined block {} was not connected", block.id());
            return Ok(None);
        }

        if let Some(storage) = storage {
            storage.save_chain(&self.ledger)?;
        }
        network.broadcast(&Message::BlockInfo(block.clone()));
        Ok(Some((block, stats)))
    }

    /// Mine until `count` blocks have been connected
    pub fn mine_blocks(
        &self,
        pay_to: &str,
        count: usize,
        storage: Option<&Storage>,
        network: &dyn PeerNetwork,
    ) -> Result<Vec<(Block, MiningStats)>, MiningError> {
        let mut results = Vec::new();
        while results.len() < count && !self.is_shutdown() {
            if let Some(result) = self.mine_and_connect(pay_to, storage, network)? {
                results.push(result);
            }
        }
        Ok(results)
    }

    /// Load the stored chain, sync with peers, then mine until shut down
    pub fn mine_forever(
        &self,
        pay_to: &str,
        storage: &Storage,
        network: &dyn PeerNetwork,
    ) -> Result<(), MiningError> {
        match storage.load_chain(&self.ledger) {
            Ok(loaded) => info!("Loaded {} blocks from storage", loaded),
            Err(e) => warn!("Could not load chain, starting from genesis: {}", e),
        }

        network.request_initial_sync();
        self.wait_for_initial_sync();

        info!("Mining to {}", pay_to);
        while !self.is_shutdown() {
            self.mine_and_connect(pay_to, Some(storage), network)?;
        }
        info!("Miner stopped");
        Ok(())
    }

    fn wait_for_initial_sync(&self) {
        let deadline = Instant::now() + Duration::from_secs(self.config.initial_sync_wait_secs);
        while !self.ledger.is_initial_sync_complete() && !self.is_shutdown() {
            if Instant::now() >= deadline {
                // TODO: roll back a partial download instead of mining on top of it
                warn!("Initial sync did not finish in time, mining anyway");
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
}
