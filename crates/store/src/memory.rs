//! In-process sharded key-value store.
//!
//! [`MemoryStore`] implements [`KeyValueClient`] without any network I/O.
//! It backs `memory://` databases for local development and is the server
//! double for engine tests, which is why it carries fault-injection hooks
//! (per-key command errors, transient scan failures, full outage and a
//! scan callback for simulating concurrent clients).
//!
//! Scan cursors are insertion sequence numbers: every key present for the
//! whole duration of a scan is returned exactly once, regardless of
//! concurrent deletes or inserts.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use kvdesk_core::bulk_action::KeyType;

use crate::client::{Command, CommandOutcome, KeyValueClient, Reply, ScanOptions, ScanPage, ShardId};
use crate::error::StoreError;
use crate::glob::GlobPattern;
use crate::slots::key_slot;

/// Callback invoked before every scan call with the shard and cursor.
pub type ScanHook = Arc<dyn Fn(&MemoryStore, &str, u64) + Send + Sync>;

#[derive(Debug, Clone)]
enum Value {
    String(String),
    Hash(BTreeMap<String, String>),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
    Zset(BTreeMap<String, f64>),
}

impl Value {
    fn key_type(&self) -> KeyType {
        match self {
            Value::String(_) => KeyType::String,
            Value::Hash(_) => KeyType::Hash,
            Value::List(_) => KeyType::List,
            Value::Set(_) => KeyType::Set,
            Value::Zset(_) => KeyType::Zset,
        }
    }
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    value: Value,
}

#[derive(Debug, Default)]
struct ShardData {
    next_seq: u64,
    order: BTreeMap<u64, String>,
    entries: HashMap<String, Entry>,
}

impl ShardData {
    fn insert(&mut self, key: &str, value: Value) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.value = value;
            return;
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        self.order.insert(seq, key.to_string());
        self.entries.insert(key.to_string(), Entry { seq, value });
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.remove(&entry.seq);
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct Faults {
    unreachable: bool,
    command_errors: HashMap<String, String>,
    scan_failures: HashMap<ShardId, u32>,
    scan_errors: HashMap<ShardId, String>,
    down_shards: HashSet<ShardId>,
    scan_hook: Option<ScanHook>,
}

/// Sharded in-memory key-value store.
pub struct MemoryStore {
    shard_ids: Vec<ShardId>,
    shards: Vec<Mutex<ShardData>>,
    faults: Mutex<Faults>,
}

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

impl MemoryStore {
    /// Create a store with `shard_count` shards (at least one), named
    /// `memory-0`, `memory-1`, ...
    pub fn new(shard_count: usize) -> Self {
        let count = shard_count.max(1);
        Self {
            shard_ids: (0..count).map(|i| format!("memory-{i}")).collect(),
            shards: (0..count).map(|_| Mutex::new(ShardData::default())).collect(),
            faults: Mutex::new(Faults::default()),
        }
    }

    // ---- direct data access (bypasses fault injection) ----

    /// Store a string value, routed to its owning shard.
    pub fn set_string(&self, key: &str, value: &str) {
        self.lock_shard(self.shard_index(key))
            .insert(key, Value::String(value.to_string()));
    }

    /// Store a hash with the given field/value pairs.
    pub fn set_hash(&self, key: &str, fields: &[(&str, &str)]) {
        let map = fields
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect();
        self.lock_shard(self.shard_index(key))
            .insert(key, Value::Hash(map));
    }

    /// Remove a key as another client would. Returns whether it existed.
    pub fn remove(&self, key: &str) -> bool {
        self.lock_shard(self.shard_index(key)).remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock_shard(self.shard_index(key))
            .entries
            .contains_key(key)
    }

    /// Type of the value stored at `key`, if any.
    pub fn key_type(&self, key: &str) -> Option<KeyType> {
        self.lock_shard(self.shard_index(key))
            .entries
            .get(key)
            .map(|e| e.value.key_type())
    }

    /// Total number of keys across all shards.
    pub fn len(&self) -> usize {
        (0..self.shards.len())
            .map(|i| self.lock_shard(i).entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ---- fault injection ----

    /// Make every command operating on `key` fail with `message`.
    pub fn inject_command_error(&self, key: &str, message: &str) {
        self.lock_faults()
            .command_errors
            .insert(key.to_string(), message.to_string());
    }

    /// Fail the next `times` scan calls on `shard` with a connection error.
    pub fn inject_scan_failures(&self, shard: &str, times: u32) {
        self.lock_faults()
            .scan_failures
            .insert(shard.to_string(), times);
    }

    /// Make every scan call on `shard` fail with a server error reply.
    pub fn inject_scan_error(&self, shard: &str, message: &str) {
        self.lock_faults()
            .scan_errors
            .insert(shard.to_string(), message.to_string());
    }

    /// Toggle an outage of a single shard.
    pub fn set_shard_unreachable(&self, shard: &str, unreachable: bool) {
        let mut faults = self.lock_faults();
        if unreachable {
            faults.down_shards.insert(shard.to_string());
        } else {
            faults.down_shards.remove(shard);
        }
    }

    /// Toggle a full outage: every client call fails with a connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock_faults().unreachable = unreachable;
    }

    /// Install a callback run before each scan call.
    pub fn set_scan_hook(&self, hook: ScanHook) {
        self.lock_faults().scan_hook = Some(hook);
    }

    // ---- internals ----

    fn shard_index(&self, key: &str) -> usize {
        key_slot(key) as usize % self.shards.len()
    }

    fn shard_position(&self, shard: &str) -> Result<usize, StoreError> {
        self.shard_ids
            .iter()
            .position(|id| id == shard)
            .ok_or_else(|| StoreError::UnknownShard(shard.to_string()))
    }

    fn lock_shard(&self, index: usize) -> MutexGuard<'_, ShardData> {
        self.shards[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_faults(&self) -> MutexGuard<'_, Faults> {
        self.faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_reachable(&self, shard: &str) -> Result<(), StoreError> {
        let faults = self.lock_faults();
        if faults.unreachable || faults.down_shards.contains(shard) {
            return Err(StoreError::connection(shard, "connection refused"));
        }
        Ok(())
    }

    fn execute(&self, shard_index: usize, command: &Command) -> CommandOutcome {
        let name = command.name.to_ascii_uppercase();

        if let Some(key) = command.key() {
            if let Some(message) = self.lock_faults().command_errors.get(key) {
                return Err(message.clone());
            }
            if name != "PING" && self.shard_index(key) != shard_index {
                let slot = key_slot(key);
                let owner = &self.shard_ids[self.shard_index(key)];
                return Err(format!("MOVED {slot} {owner}"));
            }
        }

        let args = &command.args;
        let mut data = self.lock_shard(shard_index);

        match name.as_str() {
            "PING" => Ok(Reply::Status("PONG".into())),
            "DEL" | "UNLINK" => {
                require_args(&name, args, 1)?;
                let removed = args.iter().filter(|k| data.remove(k)).count();
                Ok(Reply::Integer(removed as i64))
            }
            "SET" => {
                require_args(&name, args, 2)?;
                data.insert(&args[0], Value::String(args[1].clone()));
                Ok(Reply::Status("OK".into()))
            }
            "GET" => {
                require_exact(&name, args, 1)?;
                match data.entries.get(&args[0]).map(|e| &e.value) {
                    None => Ok(Reply::Nil),
                    Some(Value::String(s)) => Ok(Reply::Bulk(s.clone().into_bytes())),
                    Some(_) => Err(WRONGTYPE.into()),
                }
            }
            "HSET" => {
                if args.len() < 3 || args.len() % 2 == 0 {
                    return Err(wrong_arity(&name));
                }
                let mut map = match data.entries.get(&args[0]).map(|e| &e.value) {
                    None => BTreeMap::new(),
                    Some(Value::Hash(map)) => map.clone(),
                    Some(_) => return Err(WRONGTYPE.into()),
                };
                let added = args[1..]
                    .chunks(2)
                    .filter(|pair| map.insert(pair[0].clone(), pair[1].clone()).is_none())
                    .count();
                data.insert(&args[0], Value::Hash(map));
                Ok(Reply::Integer(added as i64))
            }
            "RPUSH" | "LPUSH" => {
                require_args(&name, args, 2)?;
                let mut list = match data.entries.get(&args[0]).map(|e| &e.value) {
                    None => VecDeque::new(),
                    Some(Value::List(list)) => list.clone(),
                    Some(_) => return Err(WRONGTYPE.into()),
                };
                for item in &args[1..] {
                    if name == "RPUSH" {
                        list.push_back(item.clone());
                    } else {
                        list.push_front(item.clone());
                    }
                }
                let len = list.len();
                data.insert(&args[0], Value::List(list));
                Ok(Reply::Integer(len as i64))
            }
            "SADD" => {
                require_args(&name, args, 2)?;
                let mut set = match data.entries.get(&args[0]).map(|e| &e.value) {
                    None => BTreeSet::new(),
                    Some(Value::Set(set)) => set.clone(),
                    Some(_) => return Err(WRONGTYPE.into()),
                };
                let added = args[1..].iter().filter(|m| set.insert((*m).clone())).count();
                data.insert(&args[0], Value::Set(set));
                Ok(Reply::Integer(added as i64))
            }
            "ZADD" => {
                if args.len() < 3 || args.len() % 2 == 0 {
                    return Err(wrong_arity(&name));
                }
                let mut zset = match data.entries.get(&args[0]).map(|e| &e.value) {
                    None => BTreeMap::new(),
                    Some(Value::Zset(zset)) => zset.clone(),
                    Some(_) => return Err(WRONGTYPE.into()),
                };
                let mut added = 0;
                for pair in args[1..].chunks(2) {
                    let score: f64 = pair[0]
                        .parse()
                        .map_err(|_| "ERR value is not a valid float".to_string())?;
                    if zset.insert(pair[1].clone(), score).is_none() {
                        added += 1;
                    }
                }
                data.insert(&args[0], Value::Zset(zset));
                Ok(Reply::Integer(added))
            }
            "EXPIRE" => {
                require_exact(&name, args, 2)?;
                args[1]
                    .parse::<i64>()
                    .map_err(|_| "ERR value is not an integer or out of range".to_string())?;
                Ok(Reply::Integer(i64::from(data.entries.contains_key(&args[0]))))
            }
            _ => Err(format!("ERR unknown command '{}'", command.name)),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1)
    }
}

fn wrong_arity(name: &str) -> String {
    format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_ascii_lowercase()
    )
}

fn require_args(name: &str, args: &[String], min: usize) -> Result<(), String> {
    if args.len() < min {
        return Err(wrong_arity(name));
    }
    Ok(())
}

fn require_exact(name: &str, args: &[String], count: usize) -> Result<(), String> {
    if args.len() != count {
        return Err(wrong_arity(name));
    }
    Ok(())
}

#[async_trait]
impl KeyValueClient for MemoryStore {
    fn shards(&self) -> Vec<ShardId> {
        self.shard_ids.clone()
    }

    fn route(&self, key: &str) -> ShardId {
        self.shard_ids[self.shard_index(key)].clone()
    }

    async fn db_size(&self, shard: &str) -> Result<u64, StoreError> {
        self.check_reachable(shard)?;
        let index = self.shard_position(shard)?;
        Ok(self.lock_shard(index).entries.len() as u64)
    }

    async fn scan(
        &self,
        shard: &str,
        cursor: u64,
        options: &ScanOptions,
    ) -> Result<ScanPage, StoreError> {
        let hook = self.lock_faults().scan_hook.clone();
        if let Some(hook) = hook {
            hook(self, shard, cursor);
        }

        self.check_reachable(shard)?;
        {
            let mut faults = self.lock_faults();
            if let Some(remaining) = faults.scan_failures.get_mut(shard) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::connection(shard, "injected scan failure"));
                }
            }
            if let Some(message) = faults.scan_errors.get(shard) {
                return Err(StoreError::Server(message.clone()));
            }
        }

        let index = self.shard_position(shard)?;
        let pattern = GlobPattern::new(&options.pattern)
            .map_err(|e| StoreError::Server(format!("ERR invalid pattern: {e}")))?;
        let data = self.lock_shard(index);

        let mut keys = Vec::new();
        let mut last_seq = None;
        for (&seq, key) in data
            .order
            .range(cursor.max(1)..)
            .take(options.count.max(1) as usize)
        {
            last_seq = Some(seq);
            let type_ok = match (options.key_type, data.entries.get(key)) {
                (Some(wanted), Some(entry)) => entry.value.key_type() == wanted,
                _ => true,
            };
            if type_ok && pattern.matches(key) {
                keys.push(key.clone());
            }
        }

        let next = match last_seq {
            Some(seq) if data.order.range(seq + 1..).next().is_some() => seq + 1,
            _ => 0,
        };
        Ok(ScanPage { cursor: next, keys })
    }

    async fn pipeline(
        &self,
        shard: &str,
        commands: &[Command],
    ) -> Result<Vec<CommandOutcome>, StoreError> {
        self.check_reachable(shard)?;
        let index = self.shard_position(shard)?;
        Ok(commands.iter().map(|c| self.execute(index, c)).collect())
    }
}
