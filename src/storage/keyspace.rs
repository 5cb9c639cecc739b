//! In-process key/sorted-set engine
//!
//! The sorted-set backend stores entries in redis-shaped structures: hash
//! blobs, score-ordered sets and plain sets, all with optional per-key TTL.
//! This engine provides those structures in process memory, with every
//! multi-command exchange applied atomically through [`Keyspace::pipeline`]
//! (the in-process equivalent of one pipelined round trip).
//!
//! Expired keys are treated as absent on read and reclaimed lazily when a
//! writer touches them.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::{Duration, Instant};

#[derive(Debug)]
enum KeyValue {
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    Zset(Zset),
}

/// Sorted set keyed both ways: member -> score for O(1) updates and
/// (score, member) for ordered range scans.
#[derive(Debug, Default)]
struct Zset {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl Zset {
    fn insert(&mut self, score: i64, member: String) {
        if let Some(previous) = self.scores.insert(member.clone(), score) {
            self.ordered.remove(&(previous, member.clone()));
        }
        self.ordered.insert((score, member));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }
}

#[derive(Debug)]
struct Slot {
    value: KeyValue,
    expires_at: Option<Instant>,
}

/// The shared keyspace. Clone the surrounding `Arc` to share between a
/// repository and its readers.
#[derive(Debug, Default)]
pub struct Keyspace {
    inner: RwLock<HashMap<String, Slot>>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batch of commands atomically. Commands inside the closure
    /// see each other's effects; no other pipeline interleaves.
    pub fn pipeline<R>(&self, f: impl FnOnce(&mut Pipe<'_>) -> R) -> R {
        let mut guard = self.inner.write();
        let mut pipe = Pipe {
            map: &mut *guard,
            now: Instant::now(),
        };
        f(&mut pipe)
    }
}

/// Exclusive view of the keyspace for the duration of one pipeline.
pub struct Pipe<'a> {
    map: &'a mut HashMap<String, Slot>,
    now: Instant,
}

impl Pipe<'_> {
    fn live(&self, key: &str) -> Option<&Slot> {
        self.map
            .get(key)
            .filter(|slot| slot.expires_at.map_or(true, |at| at > self.now))
    }

    /// Drop the slot if its TTL has passed, so a writer starts fresh.
    fn reclaim_expired(&mut self, key: &str) {
        let now = self.now;
        let expired = self
            .map
            .get(key)
            .is_some_and(|slot| slot.expires_at.is_some_and(|at| at <= now));
        if expired {
            self.map.remove(key);
        }
    }

    /// Fetch the slot for writing, reclaiming it if expired.
    fn writable(&mut self, key: &str) -> Option<&mut Slot> {
        self.reclaim_expired(key);
        self.map.get_mut(key)
    }

    // Hashes

    pub fn hset<I>(&mut self, key: &str, fields: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.reclaim_expired(key);
        let slot = self.map.entry(key.to_string()).or_insert_with(|| Slot {
            value: KeyValue::Hash(HashMap::new()),
            expires_at: None,
        });
        if !matches!(slot.value, KeyValue::Hash(_)) {
            // Writing a hash over a key of another type replaces it.
            slot.value = KeyValue::Hash(HashMap::new());
            slot.expires_at = None;
        }
        if let KeyValue::Hash(hash) = &mut slot.value {
            for (field, value) in fields {
                hash.insert(field, value);
            }
        }
    }

    pub fn hgetall(&self, key: &str) -> Option<HashMap<String, String>> {
        match self.live(key).map(|slot| &slot.value) {
            Some(KeyValue::Hash(hash)) => Some(hash.clone()),
            _ => None,
        }
    }

    // Sorted sets

    pub fn zadd(&mut self, key: &str, score: i64, member: impl Into<String>) {
        self.reclaim_expired(key);
        let slot = self.map.entry(key.to_string()).or_insert_with(|| Slot {
            value: KeyValue::Zset(Zset::default()),
            expires_at: None,
        });
        if !matches!(slot.value, KeyValue::Zset(_)) {
            slot.value = KeyValue::Zset(Zset::default());
            slot.expires_at = None;
        }
        if let KeyValue::Zset(zset) = &mut slot.value {
            zset.insert(score, member.into());
        }
    }

    pub fn zrem(&mut self, key: &str, members: &[String]) -> u64 {
        let mut removed = 0;
        if let Some(KeyValue::Zset(zset)) = self.writable(key).map(|slot| &mut slot.value) {
            for member in members {
                if zset.remove(member) {
                    removed += 1;
                }
            }
        }
        removed
    }

    pub fn zcard(&self, key: &str) -> usize {
        match self.live(key).map(|slot| &slot.value) {
            Some(KeyValue::Zset(zset)) => zset.ordered.len(),
            _ => 0,
        }
    }

    /// Members with score at most `max` (unbounded when `None`), highest
    /// score first, windowed by `offset` and `limit`.
    pub fn zrevrangebyscore(
        &self,
        key: &str,
        max: Option<i64>,
        offset: usize,
        limit: Option<usize>,
    ) -> Vec<(String, i64)> {
        let zset = match self.live(key).map(|slot| &slot.value) {
            Some(KeyValue::Zset(zset)) => zset,
            _ => return Vec::new(),
        };

        let selected = zset
            .ordered
            .iter()
            .rev()
            .filter(|(score, _)| max.map_or(true, |max| *score <= max))
            .skip(offset);

        match limit {
            Some(limit) => selected
                .take(limit)
                .map(|(score, member)| (member.clone(), *score))
                .collect(),
            None => selected
                .map(|(score, member)| (member.clone(), *score))
                .collect(),
        }
    }

    /// All members ranked below the newest `offset`, highest score first.
    pub fn zrevrange_from(&self, key: &str, offset: usize) -> Vec<String> {
        match self.live(key).map(|slot| &slot.value) {
            Some(KeyValue::Zset(zset)) => zset
                .ordered
                .iter()
                .rev()
                .skip(offset)
                .map(|(_, member)| member.clone())
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Remove every member scored at or below `max`.
    pub fn zremrangebyscore_upto(&mut self, key: &str, max: i64) -> u64 {
        let stale: Vec<String> = match self.live(key).map(|slot| &slot.value) {
            Some(KeyValue::Zset(zset)) => zset
                .ordered
                .iter()
                .take_while(|(score, _)| *score <= max)
                .map(|(_, member)| member.clone())
                .collect(),
            _ => return 0,
        };
        self.zrem(key, &stale)
    }

    /// Intersect two sorted sets into `dest`, keeping the larger score for
    /// members present in both. Replaces whatever `dest` held.
    pub fn zinterstore_max(&mut self, dest: &str, left: &str, right: &str) -> usize {
        let mut result = Zset::default();
        if let (Some(KeyValue::Zset(a)), Some(KeyValue::Zset(b))) = (
            self.live(left).map(|slot| &slot.value),
            self.live(right).map(|slot| &slot.value),
        ) {
            for (member, score) in &a.scores {
                if let Some(other) = b.scores.get(member) {
                    result.insert((*score).max(*other), member.clone());
                }
            }
        }

        let cardinality = result.ordered.len();
        self.map.insert(
            dest.to_string(),
            Slot {
                value: KeyValue::Zset(result),
                expires_at: None,
            },
        );
        cardinality
    }

    // Plain sets

    pub fn sadd<I>(&mut self, key: &str, members: I) -> u64
    where
        I: IntoIterator<Item = String>,
    {
        self.reclaim_expired(key);
        let slot = self.map.entry(key.to_string()).or_insert_with(|| Slot {
            value: KeyValue::Set(HashSet::new()),
            expires_at: None,
        });
        if !matches!(slot.value, KeyValue::Set(_)) {
            slot.value = KeyValue::Set(HashSet::new());
            slot.expires_at = None;
        }
        let mut added = 0;
        if let KeyValue::Set(set) = &mut slot.value {
            for member in members {
                if set.insert(member) {
                    added += 1;
                }
            }
        }
        added
    }

    pub fn srem(&mut self, key: &str, members: &[String]) -> u64 {
        let mut removed = 0;
        if let Some(KeyValue::Set(set)) = self.writable(key).map(|slot| &mut slot.value) {
            for member in members {
                if set.remove(member) {
                    removed += 1;
                }
            }
        }
        removed
    }

    pub fn smembers(&self, key: &str) -> Vec<String> {
        match self.live(key).map(|slot| &slot.value) {
            Some(KeyValue::Set(set)) => set.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    // Key lifecycle

    pub fn expire(&mut self, key: &str, ttl: Duration) {
        let now = self.now;
        if let Some(slot) = self.writable(key) {
            slot.expires_at = Some(now + ttl);
        }
    }

    pub fn del(&mut self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.live(key).is_some()
    }
}
