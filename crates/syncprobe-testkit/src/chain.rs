//! A deterministic toy ledger.
//!
//! Blocks are derived from a seed and the parent hash, so every node
//! configured with the same seed agrees on the chain without a consensus
//! protocol. Executing a block is a pure function over the keys it touches.

use std::collections::{BTreeMap, BTreeSet};

use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use syncprobe_core::{
    BlockHeight, CoreError, HashRule, KeyPrefix, MigrationSchedule, PrefixInfo, PrefixRegistry,
};

/// Account balances. State.
pub const BALANCES: u8 = 0x01;
/// Posts by id. State; posts are also deleted.
pub const POSTS: u8 = 0x02;
/// Per-block undo records. Only block-synced heights have them.
pub const UNDO: u8 = 0x03;
/// Block hash by height.
pub const BLOCK_HASHES: u8 = 0x04;
/// Encoded block by height. Missing below the snapshot on non-archival hypersync nodes.
pub const BLOCK_BODIES: u8 = 0x05;
/// Transaction hash to (height, index). Lives in the tx index store.
pub const TX_INDEX: u8 = 0x10;

pub const ACCOUNTS: u32 = 48;
pub const INITIAL_BALANCE: u64 = 1_000;
/// Height at which checksums switch to length-prefixed hashing.
pub const MIGRATION_HEIGHT: BlockHeight = 700;

/// The keyspace of a simulated node.
pub fn registry() -> Result<PrefixRegistry, CoreError> {
    PrefixRegistry::new()
        .with(PrefixInfo::state(KeyPrefix::from_byte(BALANCES), "balances"))?
        .with(PrefixInfo::state(KeyPrefix::from_byte(POSTS), "posts"))?
        .with(PrefixInfo::auxiliary(KeyPrefix::from_byte(UNDO), "undo").sync_path_dependent())?
        .with(PrefixInfo::auxiliary(
            KeyPrefix::from_byte(BLOCK_HASHES),
            "block-hashes",
        ))?
        .with(
            PrefixInfo::auxiliary(KeyPrefix::from_byte(BLOCK_BODIES), "block-bodies")
                .sync_path_dependent(),
        )?
        .with(PrefixInfo::auxiliary(KeyPrefix::from_byte(TX_INDEX), "tx-index"))
}

/// Checksum hashing rules over the life of the chain.
pub fn schedule() -> MigrationSchedule {
    MigrationSchedule::new(HashRule::Concat)
        .with_migration(MIGRATION_HEIGHT, HashRule::LengthPrefixed)
}

fn key(prefix: u8, suffix: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + suffix.len());
    buf.put_u8(prefix);
    buf.put_slice(suffix);
    buf.freeze()
}

pub fn balance_key(account: u32) -> Bytes {
    key(BALANCES, &account.to_be_bytes())
}

pub fn post_key(id: u64) -> Bytes {
    key(POSTS, &id.to_be_bytes())
}

pub fn undo_key(height: BlockHeight) -> Bytes {
    key(UNDO, &height.to_be_bytes())
}

pub fn hash_key(height: BlockHeight) -> Bytes {
    key(BLOCK_HASHES, &height.to_be_bytes())
}

pub fn body_key(height: BlockHeight) -> Bytes {
    key(BLOCK_BODIES, &height.to_be_bytes())
}

pub fn tx_key(hash: &[u8; 32]) -> Bytes {
    key(TX_INDEX, hash)
}

/// Decode a stored balance; absent accounts start at [`INITIAL_BALANCE`].
pub fn balance_of(value: Option<&Bytes>) -> u64 {
    match value {
        None => INITIAL_BALANCE,
        Some(v) => v[..]
            .try_into()
            .map(u64::from_be_bytes)
            .unwrap_or_default(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tx {
    Transfer { from: u32, to: u32, amount: u64 },
    Post { id: u64, author: u32, body: Bytes },
    DeletePost { id: u64 },
}

impl Tx {
    fn canonical_bytes(&self, out: &mut BytesMut) {
        match self {
            Tx::Transfer { from, to, amount } => {
                out.put_u8(0);
                out.put_u32(*from);
                out.put_u32(*to);
                out.put_u64(*amount);
            }
            Tx::Post { id, author, body } => {
                out.put_u8(1);
                out.put_u64(*id);
                out.put_u32(*author);
                out.put_u32(body.len() as u32);
                out.put_slice(body);
            }
            Tx::DeletePost { id } => {
                out.put_u8(2);
                out.put_u64(*id);
            }
        }
    }

    fn touched(&self, keys: &mut BTreeSet<Bytes>) {
        match self {
            Tx::Transfer { from, to, .. } => {
                keys.insert(balance_key(*from));
                keys.insert(balance_key(*to));
            }
            Tx::Post { id, .. } | Tx::DeletePost { id } => {
                keys.insert(post_key(*id));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: BlockHeight,
    pub prev_hash: [u8; 32],
    pub txs: Vec<Tx>,
}

impl Block {
    pub fn hash(&self) -> [u8; 32] {
        let mut buf = BytesMut::new();
        buf.put_u64(self.height);
        buf.put_slice(&self.prev_hash);
        for tx in &self.txs {
            tx.canonical_bytes(&mut buf);
        }
        *blake3::hash(&buf).as_bytes()
    }

    /// Hash of the `index`th transaction, unique across the chain.
    pub fn tx_hash(&self, index: usize) -> Option<[u8; 32]> {
        let tx = self.txs.get(index)?;
        let mut buf = BytesMut::new();
        buf.put_u64(self.height);
        buf.put_u32(index as u32);
        tx.canonical_bytes(&mut buf);
        Some(*blake3::hash(&buf).as_bytes())
    }

    /// Every state key the block reads or writes.
    pub fn touched_keys(&self) -> BTreeSet<Bytes> {
        let mut keys = BTreeSet::new();
        for tx in &self.txs {
            tx.touched(&mut keys);
        }
        keys
    }

    /// Apply the block to `state`, which must hold every touched key
    /// (`None` for absent).
    pub fn execute(&self, state: &mut BTreeMap<Bytes, Option<Bytes>>) {
        for tx in &self.txs {
            match tx {
                Tx::Transfer { from, to, amount } => {
                    if from == to {
                        continue;
                    }
                    let from_key = balance_key(*from);
                    let to_key = balance_key(*to);
                    let from_balance = balance_of(state.get(&from_key).and_then(Option::as_ref));
                    if from_balance < *amount {
                        continue;
                    }
                    let to_balance = balance_of(state.get(&to_key).and_then(Option::as_ref));

                    let remaining = from_balance - amount;
                    let from_value = (remaining > 0)
                        .then(|| Bytes::copy_from_slice(&remaining.to_be_bytes()));
                    state.insert(from_key, from_value);
                    state.insert(
                        to_key,
                        Some(Bytes::copy_from_slice(
                            &to_balance.saturating_add(*amount).to_be_bytes(),
                        )),
                    );
                }
                Tx::Post { id, author, body } => {
                    let mut value = BytesMut::with_capacity(4 + body.len());
                    value.put_u32(*author);
                    value.put_slice(body);
                    state.insert(post_key(*id), Some(value.freeze()));
                }
                Tx::DeletePost { id } => {
                    state.insert(post_key(*id), None);
                }
            }
        }
    }
}

/// Generates the canonical chain for a seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSpec {
    pub seed: u64,
}

impl ChainSpec {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// The block at `height` on top of `prev_hash`.
    pub fn block(&self, height: BlockHeight, prev_hash: [u8; 32]) -> Block {
        let mut rng = StdRng::seed_from_u64(self.seed ^ height.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        let count = rng.gen_range(1..=4usize);
        let txs = (0..count)
            .map(|index| match rng.gen_range(0..10u8) {
                0..=4 => Tx::Transfer {
                    from: rng.gen_range(0..ACCOUNTS),
                    to: rng.gen_range(0..ACCOUNTS),
                    amount: rng.gen_range(1..400),
                },
                5..=7 => {
                    let len = rng.gen_range(8..40usize);
                    let body: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                    Tx::Post {
                        id: (height << 8) | index as u64,
                        author: rng.gen_range(0..ACCOUNTS),
                        body: Bytes::from(body),
                    }
                }
                _ => {
                    let target = rng.gen_range(1..=height);
                    Tx::DeletePost {
                        id: (target << 8) | rng.gen_range(0..4u64),
                    }
                }
            })
            .collect();
        Block {
            height,
            prev_hash,
            txs,
        }
    }

    /// The first `count` blocks, linked by hash.
    pub fn blocks(&self, count: BlockHeight) -> Vec<Block> {
        let mut prev = [0u8; 32];
        (1..=count)
            .map(|height| {
                let block = self.block(height, prev);
                prev = block.hash();
                block
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_state(block: &Block) -> BTreeMap<Bytes, Option<Bytes>> {
        block.touched_keys().into_iter().map(|k| (k, None)).collect()
    }

    #[test]
    fn test_chain_is_deterministic() {
        let a = ChainSpec::new(7).blocks(50);
        let b = ChainSpec::new(7).blocks(50);
        assert_eq!(a, b);
        assert_ne!(a, ChainSpec::new(8).blocks(50));
        for pair in a.windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].hash());
        }
    }

    #[test]
    fn test_registry_classes() {
        let registry = registry().unwrap();
        assert_eq!(
            registry.state_prefixes(),
            vec![KeyPrefix::from_byte(BALANCES), KeyPrefix::from_byte(POSTS)]
        );
        let comparable = registry.comparable_prefixes();
        assert!(!comparable.contains(&KeyPrefix::from_byte(UNDO)));
        assert!(!comparable.contains(&KeyPrefix::from_byte(BLOCK_BODIES)));
        assert!(comparable.contains(&KeyPrefix::from_byte(BLOCK_HASHES)));
    }

    #[test]
    fn test_transfer_moves_balance() {
        let block = Block {
            height: 1,
            prev_hash: [0; 32],
            txs: vec![Tx::Transfer {
                from: 1,
                to: 2,
                amount: INITIAL_BALANCE,
            }],
        };
        let mut state = empty_state(&block);
        block.execute(&mut state);

        assert_eq!(state[&balance_key(1)], None);
        assert_eq!(balance_of(state[&balance_key(2)].as_ref()), 2 * INITIAL_BALANCE);
    }

    #[test]
    fn test_overdraft_is_ignored() {
        let block = Block {
            height: 1,
            prev_hash: [0; 32],
            txs: vec![Tx::Transfer {
                from: 1,
                to: 2,
                amount: INITIAL_BALANCE + 1,
            }],
        };
        let mut state = empty_state(&block);
        let before = state.clone();
        block.execute(&mut state);
        assert_eq!(state, before);
    }

    #[test]
    fn test_post_then_delete() {
        let block = Block {
            height: 3,
            prev_hash: [0; 32],
            txs: vec![
                Tx::Post {
                    id: 9,
                    author: 4,
                    body: Bytes::from_static(b"hello"),
                },
                Tx::DeletePost { id: 9 },
            ],
        };
        let mut state = empty_state(&block);
        block.execute(&mut state);
        assert_eq!(state[&post_key(9)], None);
    }

    #[test]
    fn test_tx_hashes_unique() {
        let blocks = ChainSpec::new(1).blocks(20);
        let mut seen = BTreeSet::new();
        for block in &blocks {
            for i in 0..block.txs.len() {
                assert!(seen.insert(block.tx_hash(i).unwrap()));
            }
        }
    }
}
