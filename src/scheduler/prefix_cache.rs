//! Prefix-cache-aware scheduling.
//!
//! Prompts are split into fixed-size blocks and chained-hashed; the hash of
//! each block folds in the previous block's hash and the model name, so two
//! prompts share a hash prefix exactly when they share a prompt prefix under
//! the same model. Pods remember the hashes of prompts they recently served
//! (LRU-bounded per (model, pod)); candidates are scored by how much of the
//! incoming prompt's hash sequence they already hold.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::config::PrefixCacheConfig;
use crate::datastore::PodInfo;

use super::{PostSchedulePlugin, SchedulingContext, ScorePlugin};

const SHARD_COUNT: usize = 16;

/* ============================= STORE ============================= */

type Entry = LruCache<u64, ()>;

/// Block hashes recently served per (model, pod).
///
/// Sharded by pod so scoring one candidate never contends with recording
/// against another.
pub struct PrefixCacheStore {
    config: PrefixCacheConfig,
    shards: Vec<Mutex<HashMap<(String, String), Entry>>>,
}

impl PrefixCacheStore {
    pub fn new(config: PrefixCacheConfig) -> Self {
        Self {
            config,
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, pod_key: &str) -> &Mutex<HashMap<(String, String), Entry>> {
        let mut hasher = DefaultHasher::new();
        pod_key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Chained block hashes of a prompt, capped at `max_blocks_to_match`.
    ///
    /// Only complete blocks are hashed: a trailing partial block cannot be
    /// re-used as a KV-cache block, so it never participates in matching.
    /// An empty (or shorter-than-one-block) prompt yields no hashes.
    pub fn hash_prompt(&self, model: &str, prompt: &str) -> Vec<u64> {
        let block_size = self.config.block_size.max(1);
        let mut hashes = Vec::new();
        let mut previous = [0u8; 32];

        for block in prompt.as_bytes().chunks_exact(block_size) {
            if hashes.len() >= self.config.max_blocks_to_match {
                break;
            }
            let mut hasher = Sha256::new();
            hasher.update(previous);
            hasher.update(model.as_bytes());
            hasher.update(block);
            previous = hasher.finalize().into();
            hashes.push(u64::from_be_bytes(
                previous[..8].try_into().expect("digest is 32 bytes"),
            ));
        }
        hashes
    }

    /// Length of the longest contiguous hash prefix recorded against
    /// `(model, pod)`. Lookup does not refresh recency.
    pub fn match_length(&self, model: &str, pod_key: &str, hashes: &[u64]) -> usize {
        let shard = self.shard(pod_key).lock();
        let Some(entry) = shard.get(&(model.to_string(), pod_key.to_string())) else {
            return 0;
        };
        hashes
            .iter()
            .take_while(|hash| entry.contains(*hash))
            .count()
    }

    /// Record a served prompt's hashes against the chosen pod, refreshing
    /// recency and evicting the least-recently-added past the cap.
    pub fn record(&self, model: &str, pod_key: &str, hashes: &[u64]) {
        if hashes.is_empty() {
            return;
        }
        let capacity = NonZeroUsize::new(self.config.max_hashes_per_pod.max(1))
            .expect("capacity is at least 1");
        let mut shard = self.shard(pod_key).lock();
        let entry = shard
            .entry((model.to_string(), pod_key.to_string()))
            .or_insert_with(|| LruCache::new(capacity));
        for hash in hashes {
            entry.put(*hash, ());
        }
    }

    /// Drop every entry referencing a removed pod.
    pub fn purge_pod(&self, pod_key: &str) {
        let mut shard = self.shard(pod_key).lock();
        shard.retain(|(_, pod), _| pod != pod_key);
    }

    /// Hashes currently recorded against `(model, pod)`.
    pub fn recorded_count(&self, model: &str, pod_key: &str) -> usize {
        self.shard(pod_key)
            .lock()
            .get(&(model.to_string(), pod_key.to_string()))
            .map(Entry::len)
            .unwrap_or(0)
    }
}

/* ============================= PLUGIN ============================= */

pub struct PrefixCachePlugin {
    store: Arc<PrefixCacheStore>,
}

impl PrefixCachePlugin {
    pub fn new(store: Arc<PrefixCacheStore>) -> Self {
        Self { store }
    }

    fn hashes<'a>(&self, ctx: &'a SchedulingContext) -> &'a [u64] {
        ctx.block_hashes
            .get_or_init(|| self.store.hash_prompt(&ctx.model, &ctx.prompt))
    }
}

impl ScorePlugin for PrefixCachePlugin {
    fn name(&self) -> &'static str {
        "prefix-cache"
    }

    fn score(&self, ctx: &SchedulingContext, pods: &[Arc<PodInfo>]) -> Vec<u32> {
        let hashes = self.hashes(ctx);
        if hashes.is_empty() {
            return vec![0; pods.len()];
        }
        pods.iter()
            .map(|pod| {
                let matched = self.store.match_length(&ctx.model, &pod.key, hashes);
                ((matched * 100) / hashes.len()) as u32
            })
            .collect()
    }
}

impl PostSchedulePlugin for PrefixCachePlugin {
    fn name(&self) -> &'static str {
        "prefix-cache"
    }

    fn post_schedule(&self, ctx: &SchedulingContext, chosen: &Arc<PodInfo>) {
        let hashes = self.hashes(ctx);
        self.store.record(&ctx.model, &chosen.key, hashes);
    }
}

/* ============================= TESTS ============================= */
