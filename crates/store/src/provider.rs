//! Resolution of database ids to connected clients.
//!
//! Databases are configured as `id=url` pairs separated by `;`, e.g.
//! `local=memory://4;cache=redis://:secret@10.0.0.5:6379`. Supported URLs:
//!
//! | URL                                   | Client                         |
//! |---------------------------------------|--------------------------------|
//! | `memory://` / `memory://N`            | in-process store with N shards |
//! | `redis://[user:pass@]host:port`       | standalone RESP server         |
//! | `redis+cluster://[user:pass@]h1:p1,…` | cluster, discovered from seeds |
//!
//! Clients are created on first use and cached for the provider's lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::client::KeyValueClient;
use crate::error::StoreError;
use crate::memory::MemoryStore;
use crate::resp::{Credentials, RespClient};

/// Default port when a URL omits it.
const DEFAULT_PORT: u16 = 6379;

/// Source of clients for the databases known to this process.
#[async_trait]
pub trait ClientProvider: Send + Sync {
    /// Whether `database_id` is configured at all.
    fn contains(&self, database_id: &str) -> bool;

    /// A connected client for `database_id`.
    async fn client(&self, database_id: &str) -> Result<Arc<dyn KeyValueClient>, StoreError>;
}

/// Parsed database URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseUrl {
    Memory { shards: usize },
    Standalone { addr: String, credentials: Option<Credentials> },
    Cluster { seeds: Vec<String>, credentials: Option<Credentials> },
}

impl DatabaseUrl {
    pub fn parse(url: &str) -> Result<Self, StoreError> {
        let url = url.trim();
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| StoreError::InvalidUrl(format!("missing scheme in '{url}'")))?;

        match scheme {
            "memory" => {
                let shards = if rest.is_empty() {
                    1
                } else {
                    rest.parse::<usize>()
                        .ok()
                        .filter(|n| *n > 0)
                        .ok_or_else(|| {
                            StoreError::InvalidUrl(format!("invalid shard count in '{url}'"))
                        })?
                };
                Ok(Self::Memory { shards })
            }
            "redis" => {
                let (credentials, hosts) = split_credentials(rest);
                let addr = normalize_addr(hosts.trim_end_matches('/'))?;
                Ok(Self::Standalone { addr, credentials })
            }
            "redis+cluster" => {
                let (credentials, hosts) = split_credentials(rest);
                let seeds = hosts
                    .trim_end_matches('/')
                    .split(',')
                    .filter(|h| !h.trim().is_empty())
                    .map(|h| normalize_addr(h.trim()))
                    .collect::<Result<Vec<_>, _>>()?;
                if seeds.is_empty() {
                    return Err(StoreError::InvalidUrl(format!("no cluster seeds in '{url}'")));
                }
                Ok(Self::Cluster { seeds, credentials })
            }
            other => Err(StoreError::InvalidUrl(format!("unsupported scheme '{other}'"))),
        }
    }

    async fn connect(&self) -> Result<Arc<dyn KeyValueClient>, StoreError> {
        Ok(match self {
            Self::Memory { shards } => Arc::new(MemoryStore::new(*shards)),
            Self::Standalone { addr, credentials } => {
                Arc::new(RespClient::connect(addr, credentials.clone()).await?)
            }
            Self::Cluster { seeds, credentials } => {
                Arc::new(RespClient::connect_cluster(seeds, credentials.clone()).await?)
            }
        })
    }
}

fn split_credentials(rest: &str) -> (Option<Credentials>, &str) {
    let Some((userinfo, hosts)) = rest.rsplit_once('@') else {
        return (None, rest);
    };
    let credentials = match userinfo.split_once(':') {
        Some((user, password)) => Credentials {
            username: (!user.is_empty()).then(|| user.to_string()),
            password: password.to_string(),
        },
        None => Credentials {
            username: None,
            password: userinfo.to_string(),
        },
    };
    (Some(credentials), hosts)
}

fn normalize_addr(host: &str) -> Result<String, StoreError> {
    if host.is_empty() {
        return Err(StoreError::InvalidUrl("empty host".into()));
    }
    match host.rsplit_once(':') {
        Some((h, port)) => {
            let port: u16 = port
                .parse()
                .map_err(|_| StoreError::InvalidUrl(format!("invalid port in '{host}'")))?;
            Ok(format!("{h}:{port}"))
        }
        None => Ok(format!("{host}:{DEFAULT_PORT}")),
    }
}

struct DatabaseEntry {
    url: Option<DatabaseUrl>,
    client: OnceCell<Arc<dyn KeyValueClient>>,
}

/// Provider backed by a fixed set of databases.
#[derive(Default)]
pub struct StaticClientProvider {
    databases: HashMap<String, DatabaseEntry>,
}

impl std::fmt::Debug for StaticClientProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticClientProvider")
            .field("databases", &self.databases.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StaticClientProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a `;`-separated list of `id=url` pairs.
    pub fn from_spec(spec: &str) -> Result<Self, StoreError> {
        let mut provider = Self::new();
        for entry in spec.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (id, url) = entry
                .split_once('=')
                .ok_or_else(|| StoreError::InvalidUrl(format!("expected id=url, got '{entry}'")))?;
            let id = id.trim();
            if id.is_empty() {
                return Err(StoreError::InvalidUrl(format!("empty database id in '{entry}'")));
            }
            provider = provider.with_url(id, DatabaseUrl::parse(url)?);
        }
        Ok(provider)
    }

    /// Register a database connected lazily from `url`.
    pub fn with_url(mut self, id: impl Into<String>, url: DatabaseUrl) -> Self {
        self.databases.insert(
            id.into(),
            DatabaseEntry {
                url: Some(url),
                client: OnceCell::new(),
            },
        );
        self
    }

    /// Register an already constructed client.
    pub fn with_client(mut self, id: impl Into<String>, client: Arc<dyn KeyValueClient>) -> Self {
        self.databases.insert(
            id.into(),
            DatabaseEntry {
                url: None,
                client: OnceCell::new_with(Some(client)),
            },
        );
        self
    }

    pub fn database_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.databases.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ClientProvider for StaticClientProvider {
    fn contains(&self, database_id: &str) -> bool {
        self.databases.contains_key(database_id)
    }

    async fn client(&self, database_id: &str) -> Result<Arc<dyn KeyValueClient>, StoreError> {
        let entry = self
            .databases
            .get(database_id)
            .ok_or_else(|| StoreError::UnknownDatabase(database_id.to_string()))?;

        let client = entry
            .client
            .get_or_try_init(|| async {
                let url = entry
                    .url
                    .as_ref()
                    .ok_or_else(|| StoreError::UnknownDatabase(database_id.to_string()))?;
                tracing::info!(database_id, ?url, "Connecting database");
                url.connect().await
            })
            .await?;
        Ok(Arc::clone(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn parses_memory_urls() {
        assert_eq!(DatabaseUrl::parse("memory://").unwrap(), DatabaseUrl::Memory { shards: 1 });
        assert_eq!(DatabaseUrl::parse("memory://3").unwrap(), DatabaseUrl::Memory { shards: 3 });
        assert_matches!(DatabaseUrl::parse("memory://0"), Err(StoreError::InvalidUrl(_)));
    }

    #[test]
    fn parses_standalone_with_password() {
        let url = DatabaseUrl::parse("redis://:secret@10.0.0.5:6380").unwrap();
        assert_eq!(
            url,
            DatabaseUrl::Standalone {
                addr: "10.0.0.5:6380".into(),
                credentials: Some(Credentials {
                    username: None,
                    password: "secret".into()
                }),
            }
        );
    }

    #[test]
    fn standalone_defaults_port() {
        assert_matches!(
            DatabaseUrl::parse("redis://cache.local").unwrap(),
            DatabaseUrl::Standalone { addr, credentials: None } if addr == "cache.local:6379"
        );
    }

    #[test]
    fn parses_cluster_seeds() {
        let url = DatabaseUrl::parse("redis+cluster://admin:pw@h1:7000,h2:7001").unwrap();
        let DatabaseUrl::Cluster { seeds, credentials } = url else {
            panic!("expected cluster url");
        };
        assert_eq!(seeds, vec!["h1:7000", "h2:7001"]);
        assert_eq!(credentials.unwrap().username.as_deref(), Some("admin"));
    }

    #[test]
    fn rejects_unknown_scheme_and_bad_port() {
        assert_matches!(DatabaseUrl::parse("mysql://x"), Err(StoreError::InvalidUrl(_)));
        assert_matches!(DatabaseUrl::parse("redis://h:notaport"), Err(StoreError::InvalidUrl(_)));
        assert_matches!(DatabaseUrl::parse("localhost"), Err(StoreError::InvalidUrl(_)));
    }

    #[test]
    fn spec_lists_databases() {
        let provider = StaticClientProvider::from_spec("local=memory://; other=memory://2;").unwrap();
        assert_eq!(provider.database_ids(), vec!["local", "other"]);
        assert!(provider.contains("other"));
        assert!(!provider.contains("missing"));
    }

    #[test]
    fn malformed_spec_entry_is_rejected() {
        assert_matches!(
            StaticClientProvider::from_spec("local"),
            Err(StoreError::InvalidUrl(_))
        );
    }

    #[tokio::test]
    async fn clients_are_cached() {
        let provider = StaticClientProvider::from_spec("local=memory://2").unwrap();
        let a = provider.client("local").await.unwrap();
        let b = provider.client("local").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.shards().len(), 2);
    }

    #[tokio::test]
    async fn registered_client_is_returned() {
        let store = Arc::new(MemoryStore::new(1));
        store.set_string("k", "v");
        let provider = StaticClientProvider::new().with_client("db", store.clone());
        let client = provider.client("db").await.unwrap();
        assert_eq!(client.db_size(&client.shards()[0]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_database_is_an_error() {
        let provider = StaticClientProvider::new();
        assert_matches!(
            provider.client("nope").await,
            Err(StoreError::UnknownDatabase(id)) if id == "nope"
        );
    }
}
