//! RESP2 client for standalone servers and clusters.
//!
//! Each node gets one lazily opened, mutex-guarded connection framed with
//! the `redis-protocol` codec. A pipeline holds the node's connection for
//! the whole exchange: every frame is fed, the sink is flushed once, then
//! exactly one reply per command is read back. Any I/O failure drops the
//! connection so the next call reconnects.
//!
//! In cluster mode the master nodes and their slot ranges are discovered
//! with `CLUSTER SLOTS` from the first reachable seed.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;

use crate::client::{Command, CommandOutcome, KeyValueClient, Reply, ScanOptions, ScanPage, ShardId};
use crate::error::StoreError;
use crate::slots::{key_slot, SLOT_COUNT};

/// Timeout for establishing a TCP connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for one request/response exchange (including whole pipelines).
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(60);

/// Optional `AUTH` credentials sent on every new connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: String,
}

type Connection = Framed<TcpStream, Resp2>;

/// A single node and its (re)connectable connection.
struct NodeConnection {
    addr: String,
    credentials: Option<Credentials>,
    conn: Mutex<Option<Connection>>,
}

impl NodeConnection {
    fn new(addr: String, credentials: Option<Credentials>) -> Self {
        Self {
            addr,
            credentials,
            conn: Mutex::new(None),
        }
    }

    /// Send `frames` as one pipeline and read one reply per frame.
    async fn exchange(&self, frames: Vec<BytesFrame>) -> Result<Vec<BytesFrame>, StoreError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(StoreError::connection(&self.addr, "connection unavailable"));
        };

        let result = match tokio::time::timeout(EXCHANGE_TIMEOUT, send_and_read(conn, frames)).await
        {
            Ok(result) => result.map_err(|e| StoreError::connection(&self.addr, e)),
            Err(_) => Err(StoreError::connection(&self.addr, "request timed out")),
        };

        if result.is_err() {
            tracing::debug!(addr = %self.addr, "Dropping broken connection");
            *guard = None;
        }
        result
    }

    async fn open(&self) -> Result<Connection, StoreError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| StoreError::connection(&self.addr, "connect timed out"))?
            .map_err(|e| StoreError::connection(&self.addr, e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| StoreError::connection(&self.addr, e))?;

        let mut conn = Framed::new(stream, Resp2::default());

        if let Some(creds) = &self.credentials {
            let mut auth = Command::new("AUTH");
            if let Some(user) = &creds.username {
                auth = auth.arg(user.clone());
            }
            auth = auth.arg(creds.password.clone());
            let replies = send_and_read(&mut conn, vec![command_frame(&auth)])
                .await
                .map_err(|e| StoreError::connection(&self.addr, e))?;
            if let Some(BytesFrame::Error(e)) = replies.into_iter().next() {
                return Err(StoreError::Server(format!("AUTH failed: {e}")));
            }
        }

        tracing::debug!(addr = %self.addr, "Connected");
        Ok(conn)
    }
}

async fn send_and_read(
    conn: &mut Connection,
    frames: Vec<BytesFrame>,
) -> Result<Vec<BytesFrame>, String> {
    let expected = frames.len();
    for frame in frames {
        conn.feed(frame).await.map_err(|e| e.to_string())?;
    }
    <Connection as SinkExt<BytesFrame>>::flush(conn)
        .await
        .map_err(|e| e.to_string())?;

    let mut replies = Vec::with_capacity(expected);
    while replies.len() < expected {
        match conn.next().await {
            Some(Ok(frame)) => replies.push(frame),
            Some(Err(e)) => return Err(format!("failed to read reply: {e}")),
            None => return Err("connection closed by server".to_string()),
        }
    }
    Ok(replies)
}

fn command_frame(command: &Command) -> BytesFrame {
    let mut parts = Vec::with_capacity(command.args.len() + 1);
    parts.push(BytesFrame::BulkString(Bytes::from(command.name.clone())));
    for arg in &command.args {
        parts.push(BytesFrame::BulkString(Bytes::from(arg.clone())));
    }
    BytesFrame::Array(parts)
}

fn into_outcome(frame: BytesFrame) -> CommandOutcome {
    match frame {
        BytesFrame::Error(e) => Err(e.to_string()),
        BytesFrame::SimpleString(s) => Ok(Reply::Status(String::from_utf8_lossy(&s).into_owned())),
        BytesFrame::Integer(i) => Ok(Reply::Integer(i)),
        BytesFrame::BulkString(b) => Ok(Reply::Bulk(b.to_vec())),
        BytesFrame::Null => Ok(Reply::Nil),
        BytesFrame::Array(items) => items
            .into_iter()
            .map(into_outcome)
            .collect::<Result<Vec<_>, _>>()
            .map(Reply::Array),
    }
}

fn reply_text(reply: &Reply) -> Option<String> {
    match reply {
        Reply::Status(s) => Some(s.clone()),
        Reply::Bulk(b) => Some(String::from_utf8_lossy(b).into_owned()),
        Reply::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Parse a `SCAN` reply: `[cursor, [key, ...]]`.
fn parse_scan_reply(reply: Reply) -> Result<ScanPage, StoreError> {
    let Reply::Array(mut parts) = reply else {
        return Err(StoreError::Protocol("SCAN reply is not an array".into()));
    };
    if parts.len() != 2 {
        return Err(StoreError::Protocol(format!(
            "SCAN reply has {} elements, expected 2",
            parts.len()
        )));
    }
    let keys = parts.pop();
    let cursor = parts
        .pop()
        .as_ref()
        .and_then(reply_text)
        .and_then(|c| c.parse::<u64>().ok())
        .ok_or_else(|| StoreError::Protocol("SCAN cursor is not a number".into()))?;
    let Some(Reply::Array(keys)) = keys else {
        return Err(StoreError::Protocol("SCAN keys are not an array".into()));
    };
    let keys = keys
        .iter()
        .map(|k| reply_text(k).ok_or_else(|| StoreError::Protocol("SCAN key is not a string".into())))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ScanPage { cursor, keys })
}

/// Slot ownership learned from `CLUSTER SLOTS`.
#[derive(Debug, Clone)]
struct SlotMap {
    /// Index into `RespClient::shards` for every slot.
    owners: Vec<usize>,
}

/// Parse `CLUSTER SLOTS` into the ordered master list and slot owners.
///
/// Empty host names refer to the node that answered (`seed_host`).
fn parse_cluster_slots(reply: Reply, seed_host: &str) -> Result<(Vec<String>, SlotMap), StoreError> {
    let Reply::Array(ranges) = reply else {
        return Err(StoreError::Protocol("CLUSTER SLOTS reply is not an array".into()));
    };

    let mut masters: Vec<String> = Vec::new();
    let mut owners = vec![usize::MAX; SLOT_COUNT as usize];

    for range in ranges {
        let Reply::Array(fields) = range else {
            return Err(StoreError::Protocol("slot range is not an array".into()));
        };
        let (Some(Reply::Integer(start)), Some(Reply::Integer(end)), Some(Reply::Array(node))) =
            (fields.first(), fields.get(1), fields.get(2))
        else {
            return Err(StoreError::Protocol("malformed slot range".into()));
        };
        let host = node
            .first()
            .and_then(reply_text)
            .ok_or_else(|| StoreError::Protocol("slot owner has no host".into()))?;
        let port = match node.get(1) {
            Some(Reply::Integer(p)) => *p,
            _ => return Err(StoreError::Protocol("slot owner has no port".into())),
        };
        let host = if host.is_empty() { seed_host.to_string() } else { host };
        let addr = format!("{host}:{port}");

        let index = match masters.iter().position(|m| *m == addr) {
            Some(i) => i,
            None => {
                masters.push(addr);
                masters.len() - 1
            }
        };
        if *start < 0 || *end >= i64::from(SLOT_COUNT) || start > end {
            return Err(StoreError::Protocol(format!("invalid slot range {start}-{end}")));
        }
        for slot in *start..=*end {
            owners[slot as usize] = index;
        }
    }

    if masters.is_empty() {
        return Err(StoreError::Protocol("cluster reports no slot owners".into()));
    }
    // Uncovered slots fall back to the first master; the server answers
    // with a per-command error if it does not own them either.
    for owner in owners.iter_mut().filter(|o| **o == usize::MAX) {
        *owner = 0;
    }
    Ok((masters, SlotMap { owners }))
}

/// RESP2 key-value client.
pub struct RespClient {
    shards: Vec<ShardId>,
    nodes: HashMap<ShardId, NodeConnection>,
    slots: Option<SlotMap>,
}

impl std::fmt::Debug for RespClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RespClient")
            .field("shards", &self.shards)
            .finish_non_exhaustive()
    }
}

impl RespClient {
    /// Client for a standalone server at `addr` (`host:port`).
    ///
    /// Connects eagerly so that an unreachable server is reported here.
    pub async fn connect(addr: &str, credentials: Option<Credentials>) -> Result<Self, StoreError> {
        let node = NodeConnection::new(addr.to_string(), credentials);
        node.exchange(vec![command_frame(&Command::new("PING"))]).await?;

        let mut nodes = HashMap::new();
        nodes.insert(addr.to_string(), node);
        Ok(Self {
            shards: vec![addr.to_string()],
            nodes,
            slots: None,
        })
    }

    /// Client for a cluster, discovered through the first reachable seed.
    pub async fn connect_cluster(
        seeds: &[String],
        credentials: Option<Credentials>,
    ) -> Result<Self, StoreError> {
        let mut last_error = StoreError::InvalidUrl("no cluster seeds given".into());

        for seed in seeds {
            let node = NodeConnection::new(seed.clone(), credentials.clone());
            let replies = match node
                .exchange(vec![command_frame(&Command::new("CLUSTER").arg("SLOTS"))])
                .await
            {
                Ok(replies) => replies,
                Err(e) => {
                    tracing::warn!(seed = %seed, error = %e, "Cluster seed unreachable");
                    last_error = e;
                    continue;
                }
            };

            let reply = replies
                .into_iter()
                .next()
                .map(into_outcome)
                .ok_or_else(|| StoreError::Protocol("empty CLUSTER SLOTS reply".into()))?
                .map_err(StoreError::Server)?;
            let seed_host = seed.rsplit_once(':').map(|(h, _)| h).unwrap_or(seed);
            let (masters, slots) = parse_cluster_slots(reply, seed_host)?;

            tracing::info!(masters = masters.len(), seed = %seed, "Cluster topology loaded");

            let nodes = masters
                .iter()
                .map(|addr| (addr.clone(), NodeConnection::new(addr.clone(), credentials.clone())))
                .collect();
            return Ok(Self {
                shards: masters,
                nodes,
                slots: Some(slots),
            });
        }

        Err(last_error)
    }

    fn node(&self, shard: &str) -> Result<&NodeConnection, StoreError> {
        self.nodes
            .get(shard)
            .ok_or_else(|| StoreError::UnknownShard(shard.to_string()))
    }

    /// Run a single command whose reply the caller depends on; error
    /// replies become [`StoreError::Server`].
    async fn call(&self, shard: &str, command: Command) -> Result<Reply, StoreError> {
        let replies = self.node(shard)?.exchange(vec![command_frame(&command)]).await?;
        replies
            .into_iter()
            .next()
            .map(into_outcome)
            .ok_or_else(|| StoreError::Protocol("missing reply".into()))?
            .map_err(StoreError::Server)
    }
}

#[async_trait]
impl KeyValueClient for RespClient {
    fn shards(&self) -> Vec<ShardId> {
        self.shards.clone()
    }

    fn route(&self, key: &str) -> ShardId {
        match &self.slots {
            Some(map) => self.shards[map.owners[key_slot(key) as usize]].clone(),
            None => self.shards[0].clone(),
        }
    }

    async fn db_size(&self, shard: &str) -> Result<u64, StoreError> {
        match self.call(shard, Command::new("DBSIZE")).await? {
            Reply::Integer(n) => Ok(n.max(0) as u64),
            other => Err(StoreError::Protocol(format!("unexpected DBSIZE reply {other:?}"))),
        }
    }

    async fn scan(
        &self,
        shard: &str,
        cursor: u64,
        options: &ScanOptions,
    ) -> Result<ScanPage, StoreError> {
        let mut command = Command::new("SCAN")
            .arg(cursor.to_string())
            .arg("MATCH")
            .arg(options.pattern.clone())
            .arg("COUNT")
            .arg(options.count.to_string());
        if let Some(key_type) = options.key_type {
            command = command.arg("TYPE").arg(key_type.as_str());
        }
        parse_scan_reply(self.call(shard, command).await?)
    }

    async fn pipeline(
        &self,
        shard: &str,
        commands: &[Command],
    ) -> Result<Vec<CommandOutcome>, StoreError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let frames = commands.iter().map(command_frame).collect();
        let replies = self.node(shard)?.exchange(frames).await?;
        Ok(replies.into_iter().map(into_outcome).collect())
    }
}
