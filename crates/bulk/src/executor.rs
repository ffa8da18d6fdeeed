//! Batch execution.
//!
//! A batch either holds scanned keys (delete) or caller-supplied command
//! lines (upload). Execution pipelines one command per item and reports
//! one [`ItemOutcome`] per item, in input order. Server error replies are
//! per-item failures; only a whole-pipeline [`StoreError`](kvdesk_store::StoreError)
//! escalates to a [`RunError`], carried by a [`BatchFailure`] together with
//! the outcomes of the items that ran before it.

use std::collections::HashMap;

use kvdesk_core::upload::parse_command_line;
use kvdesk_store::{Command, CommandOutcome, KeyValueClient, ShardId, StoreError};

use crate::error::RunError;
use crate::scan::KeyBatch;

/// One unit of work pulled from a bulk action's source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Batch {
    /// Keys scanned from one shard, to be deleted.
    Keys(KeyBatch),
    /// Raw upload command lines.
    Records(Vec<String>),
}

impl Batch {
    /// Number of items the batch contributes to `progress.scanned`.
    pub fn len(&self) -> usize {
        match self {
            Batch::Keys(batch) => batch.keys.len(),
            Batch::Records(lines) => lines.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result for a single key or command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    /// The key (or, for upload lines without one, the command text).
    pub key: String,
    /// `None` on success, otherwise the failure message.
    pub error: Option<String>,
}

impl ItemOutcome {
    fn from_outcome(key: String, outcome: CommandOutcome) -> Self {
        Self {
            key,
            error: outcome.err(),
        }
    }
}

/// A batch that stopped part way.
#[derive(Debug)]
pub struct BatchFailure {
    /// Outcomes of items already executed (or rejected while parsing), in
    /// input order. Items after the failure point have no outcome.
    pub completed: Vec<ItemOutcome>,
    pub error: RunError,
}

impl From<RunError> for BatchFailure {
    fn from(error: RunError) -> Self {
        Self {
            completed: Vec::new(),
            error,
        }
    }
}

pub async fn execute(client: &dyn KeyValueClient, batch: &Batch) -> Result<Vec<ItemOutcome>, BatchFailure> {
    match batch {
        Batch::Keys(keys) => delete_keys(client, keys).await,
        Batch::Records(lines) => upload_lines(client, lines).await,
    }
}

/// Pipeline one `DEL` per key on the batch's shard.
///
/// `DEL` of an absent key replies `0`, which counts as success.
pub async fn delete_keys(
    client: &dyn KeyValueClient,
    batch: &KeyBatch,
) -> Result<Vec<ItemOutcome>, BatchFailure> {
    if batch.keys.is_empty() {
        return Ok(Vec::new());
    }

    let commands: Vec<Command> = batch
        .keys
        .iter()
        .map(|key| Command::new("DEL").arg(key.clone()))
        .collect();
    let outcomes = run_pipeline(client, &batch.shard, &commands).await?;

    Ok(batch
        .keys
        .iter()
        .cloned()
        .zip(outcomes)
        .map(|(key, outcome)| ItemOutcome::from_outcome(key, outcome))
        .collect())
}

/// Parse and execute upload command lines.
///
/// Commands are grouped by the shard owning their key (first argument) and
/// each group runs as one pipeline, keeping the relative order of commands
/// within a shard. Lines that fail to parse are per-item failures.
///
/// If a shard's pipeline fails, groups already executed keep their
/// outcomes and are returned in the [`BatchFailure`].
pub async fn upload_lines(
    client: &dyn KeyValueClient,
    lines: &[String],
) -> Result<Vec<ItemOutcome>, BatchFailure> {
    let mut outcomes: Vec<Option<ItemOutcome>> = vec![None; lines.len()];
    let mut groups: Vec<(ShardId, Vec<(usize, Command)>)> = Vec::new();
    let mut group_index: HashMap<ShardId, usize> = HashMap::new();
    let default_shard = client.shards().into_iter().next();

    for (i, line) in lines.iter().enumerate() {
        let command = match parse_command_line(line) {
            Ok(parts) => Command::from_parts(parts),
            Err(e) => {
                outcomes[i] = Some(ItemOutcome {
                    key: line.trim().to_string(),
                    error: Some(e.to_string()),
                });
                continue;
            }
        };
        let Some(command) = command else {
            outcomes[i] = Some(ItemOutcome {
                key: line.trim().to_string(),
                error: Some("empty command".to_string()),
            });
            continue;
        };

        let shard = match command.key() {
            Some(key) => client.route(key),
            None => match &default_shard {
                Some(shard) => shard.clone(),
                None => {
                    return Err(RunError::Pipeline {
                        shard: String::new(),
                        source: StoreError::Protocol("database has no shards".into()),
                    }
                    .into())
                }
            },
        };
        let slot = *group_index.entry(shard.clone()).or_insert_with(|| {
            groups.push((shard, Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push((i, command));
    }

    for (shard, entries) in groups {
        let commands: Vec<Command> = entries.iter().map(|(_, c)| c.clone()).collect();
        let results = match run_pipeline(client, &shard, &commands).await {
            Ok(results) => results,
            Err(error) => {
                return Err(BatchFailure {
                    completed: outcomes.into_iter().flatten().collect(),
                    error,
                })
            }
        };
        for ((i, command), outcome) in entries.into_iter().zip(results) {
            let key = command
                .key()
                .map(str::to_string)
                .unwrap_or_else(|| command.name.clone());
            outcomes[i] = Some(ItemOutcome::from_outcome(key, outcome));
        }
    }

    Ok(outcomes.into_iter().flatten().collect())
}

async fn run_pipeline(
    client: &dyn KeyValueClient,
    shard: &str,
    commands: &[Command],
) -> Result<Vec<CommandOutcome>, RunError> {
    let outcomes = client
        .pipeline(shard, commands)
        .await
        .map_err(|source| RunError::Pipeline {
            shard: shard.to_string(),
            source,
        })?;

    if outcomes.len() != commands.len() {
        return Err(RunError::Pipeline {
            shard: shard.to_string(),
            source: StoreError::Protocol(format!(
                "expected {} replies, got {}",
                commands.len(),
                outcomes.len()
            )),
        });
    }
    Ok(outcomes)
}
