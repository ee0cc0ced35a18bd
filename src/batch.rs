//! Batched multi-entity mutations
//!
//! A batch is a list of [`BatchOperation`]s executed with a single pipeline
//! round trip. Operations are processed grouped by entity (info, then
//! session, then message) in their original order within each group. Reads
//! an operation depends on (the current value for an update, the message
//! index for a session delete) happen up front; writes are queued.
//!
//! Failures are isolated per operation. Conditional writes are reconciled
//! after the pipeline runs, so a create that lost to an existing key is
//! reported as `duplicate` and an update or delete of a missing key as
//! `not_found`. The batch as a whole is not atomic.

use crate::cache::Cache;
use crate::error::{StorageError, StorageResult};
use crate::info::{validate_info_id, InfoItem};
use crate::keys;
use crate::message::{generate_message_id, validate_ids, Message, MessageUpdate};
use crate::session::{invalidate_session, queue_cascade_delete, Session};
use crate::store::{Expiry, Pipeline, Reply, SetCondition, StoreClient};
use crate::types::{Metadata, Response, TtlStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Entity a batch operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Info,
    Session,
    Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum InfoOperation {
    Create {
        category: String,
        key: String,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl: Option<u64>,
    },
    /// Replace data and TTL
    Update {
        category: String,
        key: String,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl: Option<u64>,
    },
    Delete {
        category: String,
        key: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum SessionOperation {
    Create {
        session_id: String,
        #[serde(default)]
        metadata: Metadata,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl: Option<u64>,
    },
    /// Merge metadata, keeping the TTL
    Update {
        session_id: String,
        metadata: Metadata,
    },
    /// Cascades to the session's messages
    Delete {
        session_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum MessageOperation {
    /// `message_id` of `None` generates one
    Create {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        role: String,
        content: String,
        #[serde(default)]
        metadata: Metadata,
    },
    Update {
        session_id: String,
        message_id: String,
        update: MessageUpdate,
    },
    Delete {
        session_id: String,
        message_id: String,
    },
}

/// One mutation in a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BatchOperation {
    Info(InfoOperation),
    Session(SessionOperation),
    Message(MessageOperation),
}

impl BatchOperation {
    pub fn create_info(
        category: impl Into<String>,
        key: impl Into<String>,
        data: impl Into<String>,
        ttl: Option<u64>,
    ) -> Self {
        Self::Info(InfoOperation::Create {
            category: category.into(),
            key: key.into(),
            data: data.into(),
            ttl,
        })
    }

    pub fn update_info(
        category: impl Into<String>,
        key: impl Into<String>,
        data: impl Into<String>,
        ttl: Option<u64>,
    ) -> Self {
        Self::Info(InfoOperation::Update {
            category: category.into(),
            key: key.into(),
            data: data.into(),
            ttl,
        })
    }

    pub fn delete_info(category: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Info(InfoOperation::Delete {
            category: category.into(),
            key: key.into(),
        })
    }

    pub fn create_session(session_id: impl Into<String>, metadata: Metadata, ttl: Option<u64>) -> Self {
        Self::Session(SessionOperation::Create {
            session_id: session_id.into(),
            metadata,
            ttl,
        })
    }

    pub fn update_session(session_id: impl Into<String>, metadata: Metadata) -> Self {
        Self::Session(SessionOperation::Update {
            session_id: session_id.into(),
            metadata,
        })
    }

    pub fn delete_session(session_id: impl Into<String>) -> Self {
        Self::Session(SessionOperation::Delete {
            session_id: session_id.into(),
        })
    }

    pub fn create_message(
        session_id: impl Into<String>,
        role: impl Into<String>,
        content: impl Into<String>,
        metadata: Metadata,
    ) -> Self {
        Self::Message(MessageOperation::Create {
            session_id: session_id.into(),
            message_id: None,
            role: role.into(),
            content: content.into(),
            metadata,
        })
    }

    pub fn update_message(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        update: MessageUpdate,
    ) -> Self {
        Self::Message(MessageOperation::Update {
            session_id: session_id.into(),
            message_id: message_id.into(),
            update,
        })
    }

    pub fn delete_message(session_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self::Message(MessageOperation::Delete {
            session_id: session_id.into(),
            message_id: message_id.into(),
        })
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Info(_) => EntityKind::Info,
            Self::Session(_) => EntityKind::Session,
            Self::Message(_) => EntityKind::Message,
        }
    }

    pub fn action(&self) -> BatchAction {
        match self {
            Self::Info(InfoOperation::Create { .. })
            | Self::Session(SessionOperation::Create { .. })
            | Self::Message(MessageOperation::Create { .. }) => BatchAction::Create,
            Self::Info(InfoOperation::Update { .. })
            | Self::Session(SessionOperation::Update { .. })
            | Self::Message(MessageOperation::Update { .. }) => BatchAction::Update,
            Self::Info(InfoOperation::Delete { .. })
            | Self::Session(SessionOperation::Delete { .. })
            | Self::Message(MessageOperation::Delete { .. }) => BatchAction::Delete,
        }
    }

    /// Compact `(type, operation, key)` description used in reports
    pub fn summary(&self) -> OperationSummary {
        let key = match self {
            Self::Info(
                InfoOperation::Create { category, key, .. }
                | InfoOperation::Update { category, key, .. }
                | InfoOperation::Delete { category, key },
            ) => format!("{}:{}", category, key),
            Self::Session(
                SessionOperation::Create { session_id, .. }
                | SessionOperation::Update { session_id, .. }
                | SessionOperation::Delete { session_id },
            ) => session_id.clone(),
            Self::Message(MessageOperation::Create {
                session_id,
                message_id,
                ..
            }) => match message_id {
                Some(id) => format!("{}:{}", session_id, id),
                None => session_id.clone(),
            },
            Self::Message(
                MessageOperation::Update {
                    session_id,
                    message_id,
                    ..
                }
                | MessageOperation::Delete {
                    session_id,
                    message_id,
                },
            ) => format!("{}:{}", session_id, message_id),
        };
        OperationSummary {
            kind: self.kind(),
            operation: self.action(),
            key,
        }
    }
}

/// Loose wire form of a batch operation
///
/// `key` is composite: `<category>:<key>` for info, `<sessionId>` for
/// sessions and `<sessionId>:<messageId>` for messages. `data` carries the
/// payload: `{"data": …}` for info, `{"metadata": {…}}` for session create,
/// the metadata updates themselves for session update, and
/// `{"role", "content", "metadata"}` for messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDescriptor {
    pub operation: BatchAction,
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub key: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl BatchDescriptor {
    pub fn summary(&self) -> OperationSummary {
        OperationSummary {
            kind: self.kind,
            operation: self.operation,
            key: self.key.clone(),
        }
    }
}

fn invalid(message: impl Into<String>) -> StorageError {
    StorageError::InvalidInput(message.into())
}

fn split_pair<'a>(key: &'a str, what: &str) -> StorageResult<(&'a str, &'a str)> {
    match key.split_once(':') {
        Some((a, b)) if !a.is_empty() && !b.is_empty() => Ok((a, b)),
        _ => Err(invalid(format!("{} key '{}' must look like '<a>:<b>'", what, key))),
    }
}

fn string_field(data: &serde_json::Value, field: &str) -> StorageResult<String> {
    data.get(field)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| invalid(format!("field '{}' must be a string", field)))
}

fn metadata_value(value: Option<&serde_json::Value>) -> StorageResult<Metadata> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(Metadata::new()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| invalid(format!("metadata: {}", e))),
    }
}

fn info_data(data: &serde_json::Value) -> StorageResult<String> {
    match data {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => string_field(other, "data"),
    }
}

impl TryFrom<BatchDescriptor> for BatchOperation {
    type Error = StorageError;

    fn try_from(desc: BatchDescriptor) -> Result<Self, Self::Error> {
        let op = match desc.kind {
            EntityKind::Info => {
                let (category, key) = split_pair(&desc.key, "info")?;
                let (category, key) = (category.to_string(), key.to_string());
                match desc.operation {
                    BatchAction::Create => Self::Info(InfoOperation::Create {
                        category,
                        key,
                        data: info_data(&desc.data)?,
                        ttl: desc.ttl,
                    }),
                    BatchAction::Update => Self::Info(InfoOperation::Update {
                        category,
                        key,
                        data: info_data(&desc.data)?,
                        ttl: desc.ttl,
                    }),
                    BatchAction::Delete => Self::Info(InfoOperation::Delete { category, key }),
                }
            }
            EntityKind::Session => {
                let session_id = desc.key.clone();
                match desc.operation {
                    BatchAction::Create => Self::Session(SessionOperation::Create {
                        session_id,
                        metadata: metadata_value(desc.data.get("metadata"))?,
                        ttl: desc.ttl,
                    }),
                    BatchAction::Update => Self::Session(SessionOperation::Update {
                        session_id,
                        metadata: metadata_value(Some(&desc.data))?,
                    }),
                    BatchAction::Delete => Self::Session(SessionOperation::Delete { session_id }),
                }
            }
            EntityKind::Message => match desc.operation {
                BatchAction::Create => {
                    let (session_id, message_id) = match desc.key.split_once(':') {
                        Some((sid, mid)) => (sid.to_string(), Some(mid.to_string())),
                        None => (desc.key.clone(), None),
                    };
                    Self::Message(MessageOperation::Create {
                        session_id,
                        message_id,
                        role: string_field(&desc.data, "role")?,
                        content: string_field(&desc.data, "content")?,
                        metadata: metadata_value(desc.data.get("metadata"))?,
                    })
                }
                BatchAction::Update => {
                    let (session_id, message_id) = split_pair(&desc.key, "message")?;
                    let update = if desc.data.is_null() {
                        MessageUpdate::default()
                    } else {
                        serde_json::from_value(desc.data.clone())
                            .map_err(|e| invalid(format!("message update: {}", e)))?
                    };
                    Self::Message(MessageOperation::Update {
                        session_id: session_id.to_string(),
                        message_id: message_id.to_string(),
                        update,
                    })
                }
                BatchAction::Delete => {
                    let (session_id, message_id) = split_pair(&desc.key, "message")?;
                    Self::Message(MessageOperation::Delete {
                        session_id: session_id.to_string(),
                        message_id: message_id.to_string(),
                    })
                }
            },
        };
        Ok(op)
    }
}

/// Per-operation result tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    Created,
    Updated,
    Deleted,
    NotFound,
    Duplicate,
    Error,
}

impl BatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSummary {
    #[serde(rename = "type")]
    pub kind: EntityKind,
    pub operation: BatchAction,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub operation: OperationSummary,
    pub result: BatchOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a whole batch; `results` follow input order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<BatchResult>,
}

impl BatchReport {
    fn from_results(results: Vec<BatchResult>) -> Self {
        let successful = results.iter().filter(|r| r.result.is_success()).count();
        Self {
            successful,
            failed: results.len() - successful,
            results,
        }
    }

    fn absorb(&mut self, other: BatchReport) {
        self.successful += other.successful;
        self.failed += other.failed;
        self.results.extend(other.results);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkCounts {
    pub succeeded: usize,
    pub failed: usize,
}

impl From<&BatchReport> for BulkCounts {
    fn from(report: &BatchReport) -> Self {
        Self {
            succeeded: report.successful,
            failed: report.failed,
        }
    }
}

/// Primary-key counts by entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    pub info_count: usize,
    pub session_count: usize,
    pub message_count: usize,
    pub total_keys: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Index memberships removed
    pub cleaned: usize,
    /// Indexes that could not be inspected
    pub errors: usize,
}

/// Input record for [`BatchEngine::bulk_create_info`] and
/// [`BatchEngine::bulk_update_info`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoInput {
    pub category: String,
    pub key: String,
    pub data: String,
    #[serde(default)]
    pub ttl: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInput {
    pub session_id: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub ttl: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageInput {
    pub session_id: String,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// How a queued write is judged once its reply is known
#[derive(Debug, Clone, Copy)]
enum Check {
    /// `SET NX`: refused means duplicate
    Create,
    /// `SET XX`: refused means the key vanished
    Update,
    /// `DEL`: zero means nothing was there
    Delete,
}

#[derive(Debug)]
enum Plan {
    Queued {
        reply: usize,
        check: Check,
        /// List entry to withdraw if a create turns out to be a duplicate
        undo: Option<(String, String)>,
    },
    Missing(String),
}

#[derive(Debug)]
struct Queued {
    position: usize,
    summary: OperationSummary,
    reply: usize,
    check: Check,
    undo: Option<(String, String)>,
}

/// Cache scopes a batch wrote to
#[derive(Debug, Default)]
struct Touched {
    categories: BTreeSet<String>,
    sessions: BTreeSet<String>,
}

/// Executes batches and bulk maintenance
#[derive(Debug, Clone)]
pub struct BatchEngine {
    client: StoreClient,
    cache: Cache,
    chunk_size: usize,
}

impl BatchEngine {
    /// `chunk_size` bounds the operations per pipeline for bulk wrappers
    pub fn new(client: StoreClient, cache: Cache, chunk_size: usize) -> Self {
        Self {
            client,
            cache,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Run a batch in one pipeline
    pub async fn execute(&self, operations: Vec<BatchOperation>) -> Response<BatchReport> {
        let slots = operations.into_iter().map(Ok).collect();
        Response::from_result("execute batch operations", self.run(slots).await)
    }

    /// Decode and run loose descriptors
    ///
    /// Descriptors that fail to decode are reported as `error` in their
    /// input position; the rest still run.
    pub async fn execute_descriptors(&self, descriptors: Vec<BatchDescriptor>) -> Response<BatchReport> {
        let slots = descriptors
            .into_iter()
            .map(|desc| {
                let summary = desc.summary();
                BatchOperation::try_from(desc).map_err(|e| (summary, e))
            })
            .collect();
        Response::from_result("execute batch operations", self.run(slots).await)
    }

    async fn run(
        &self,
        slots: Vec<Result<BatchOperation, (OperationSummary, StorageError)>>,
    ) -> StorageResult<BatchReport> {
        let mut results: Vec<Option<BatchResult>> = vec![None; slots.len()];
        let mut ops: Vec<(usize, BatchOperation)> = Vec::with_capacity(slots.len());
        for (position, slot) in slots.into_iter().enumerate() {
            match slot {
                Ok(op) => ops.push((position, op)),
                Err((summary, e)) => {
                    results[position] = Some(BatchResult {
                        operation: summary,
                        result: BatchOutcome::Error,
                        error: Some(e.to_string()),
                    })
                }
            }
        }
        ops.sort_by_key(|(_, op)| op.kind());

        let mut pipe = self.client.pipeline();
        let mut touched = Touched::default();
        let mut queued = Vec::new();
        for (position, op) in ops {
            let summary = op.summary();
            match self.plan(op, &mut pipe, &mut touched).await {
                Ok(Plan::Queued { reply, check, undo }) => queued.push(Queued {
                    position,
                    summary,
                    reply,
                    check,
                    undo,
                }),
                Ok(Plan::Missing(what)) => {
                    results[position] = Some(BatchResult {
                        operation: summary,
                        result: BatchOutcome::NotFound,
                        error: Some(format!("{} not found", what)),
                    })
                }
                Err(e) => {
                    warn!(key = %summary.key, error = %e, "Batch operation rejected");
                    results[position] = Some(BatchResult {
                        operation: summary,
                        result: BatchOutcome::Error,
                        error: Some(e.to_string()),
                    })
                }
            }
        }

        let replies = self.client.execute(pipe).await?;

        let mut undo = self.client.pipeline();
        for q in queued {
            let reply = replies.get(q.reply).cloned().unwrap_or(Reply::Nil);
            let (result, error) = reconcile(q.check, reply)?;
            if result == BatchOutcome::Duplicate {
                if let Some((list_key, id)) = &q.undo {
                    undo.lrem(list_key.as_str(), 1, id.as_str());
                }
            }
            results[q.position] = Some(BatchResult {
                operation: q.summary,
                result,
                error,
            });
        }
        self.client.execute(undo).await?;

        self.invalidate(&touched);

        let report = BatchReport::from_results(results.into_iter().flatten().collect());
        debug!(
            successful = report.successful,
            failed = report.failed,
            "Batch executed"
        );
        Ok(report)
    }

    async fn plan(&self, op: BatchOperation, pipe: &mut Pipeline, touched: &mut Touched) -> StorageResult<Plan> {
        match op {
            BatchOperation::Info(op) => self.plan_info(op, pipe, touched).await,
            BatchOperation::Session(op) => self.plan_session(op, pipe, touched).await,
            BatchOperation::Message(op) => self.plan_message(op, pipe, touched).await,
        }
    }

    async fn plan_info(&self, op: InfoOperation, pipe: &mut Pipeline, touched: &mut Touched) -> StorageResult<Plan> {
        match op {
            InfoOperation::Create {
                category,
                key,
                data,
                ttl,
            } => {
                validate_info_id(&category, &key)?;
                let item = InfoItem::new(&category, &key, data, ttl);
                let payload = serde_json::to_string(&item).map_err(StorageError::serialize)?;
                let reply = pipe.set(
                    item.storage_key(),
                    payload,
                    Expiry::from_ttl(ttl),
                    SetCondition::IfAbsent,
                );
                let category_key = keys::category_key(&category);
                pipe.sadd(category_key.as_str(), key.as_str());
                if let Some(secs) = ttl.filter(|s| *s > 0) {
                    pipe.expire(category_key, secs);
                }
                touched.categories.insert(category);
                Ok(Plan::Queued {
                    reply,
                    check: Check::Create,
                    undo: None,
                })
            }
            InfoOperation::Update {
                category,
                key,
                data,
                ttl,
            } => {
                validate_info_id(&category, &key)?;
                let info_key = keys::info_key(&category, &key);
                let Some(mut item) = self.client.get_json::<InfoItem>(&info_key).await? else {
                    return Ok(Plan::Missing("info item".to_string()));
                };
                item.replace_data(data, ttl);
                let payload = serde_json::to_string(&item).map_err(StorageError::serialize)?;
                let reply = pipe.set(info_key, payload, Expiry::from_ttl(ttl), SetCondition::IfPresent);
                touched.categories.insert(category);
                Ok(Plan::Queued {
                    reply,
                    check: Check::Update,
                    undo: None,
                })
            }
            InfoOperation::Delete { category, key } => {
                validate_info_id(&category, &key)?;
                let reply = pipe.del(keys::info_key(&category, &key));
                pipe.srem(keys::category_key(&category), key);
                touched.categories.insert(category);
                Ok(Plan::Queued {
                    reply,
                    check: Check::Delete,
                    undo: None,
                })
            }
        }
    }

    async fn plan_session(
        &self,
        op: SessionOperation,
        pipe: &mut Pipeline,
        touched: &mut Touched,
    ) -> StorageResult<Plan> {
        match op {
            SessionOperation::Create {
                session_id,
                metadata,
                ttl,
            } => {
                keys::validate_segment("session id", &session_id)?;
                let session = Session::new(&session_id, metadata, ttl);
                let payload = serde_json::to_string(&session).map_err(StorageError::serialize)?;
                let reply = pipe.set(
                    keys::session_key(&session_id),
                    payload,
                    Expiry::from_ttl(ttl),
                    SetCondition::IfAbsent,
                );
                pipe.sadd(keys::SESSION_INDEX, session_id.as_str());
                touched.sessions.insert(session_id);
                Ok(Plan::Queued {
                    reply,
                    check: Check::Create,
                    undo: None,
                })
            }
            SessionOperation::Update {
                session_id,
                metadata,
            } => {
                keys::validate_segment("session id", &session_id)?;
                let session_key = keys::session_key(&session_id);
                let Some(mut session) = self.client.get_json::<Session>(&session_key).await? else {
                    return Ok(Plan::Missing("session".to_string()));
                };
                session.merge_metadata(metadata);
                let payload = serde_json::to_string(&session).map_err(StorageError::serialize)?;
                let reply = pipe.set(session_key, payload, Expiry::Keep, SetCondition::IfPresent);
                touched.sessions.insert(session_id);
                Ok(Plan::Queued {
                    reply,
                    check: Check::Update,
                    undo: None,
                })
            }
            SessionOperation::Delete { session_id } => {
                keys::validate_segment("session id", &session_id)?;
                let message_ids = self
                    .client
                    .smembers(&keys::session_messages_index_key(&session_id))
                    .await?;
                let reply = queue_cascade_delete(pipe, &session_id, &message_ids);
                touched.sessions.insert(session_id);
                Ok(Plan::Queued {
                    reply,
                    check: Check::Delete,
                    undo: None,
                })
            }
        }
    }

    async fn plan_message(
        &self,
        op: MessageOperation,
        pipe: &mut Pipeline,
        touched: &mut Touched,
    ) -> StorageResult<Plan> {
        match op {
            MessageOperation::Create {
                session_id,
                message_id,
                role,
                content,
                metadata,
            } => {
                let message_id = message_id.unwrap_or_else(generate_message_id);
                validate_ids(&session_id, &message_id)?;

                let message = Message::new(&message_id, &session_id, role, content, metadata);
                let payload = serde_json::to_string(&message).map_err(StorageError::serialize)?;
                let reply = pipe.set(
                    message.storage_key(),
                    payload,
                    Expiry::Persist,
                    SetCondition::IfAbsent,
                );
                let list_key = keys::session_messages_key(&session_id);
                pipe.lpush(list_key.as_str(), message_id.as_str());
                pipe.sadd(keys::session_messages_index_key(&session_id), message_id.as_str());
                touched.sessions.insert(session_id);
                Ok(Plan::Queued {
                    reply,
                    check: Check::Create,
                    undo: Some((list_key, message_id)),
                })
            }
            MessageOperation::Update {
                session_id,
                message_id,
                update,
            } => {
                validate_ids(&session_id, &message_id)?;
                let message_key = keys::message_key(&session_id, &message_id);
                let Some(mut message) = self.client.get_json::<Message>(&message_key).await? else {
                    return Ok(Plan::Missing("message".to_string()));
                };
                update.apply(&mut message);
                let payload = serde_json::to_string(&message).map_err(StorageError::serialize)?;
                let reply = pipe.set(message_key, payload, Expiry::Keep, SetCondition::IfPresent);
                touched.sessions.insert(session_id);
                Ok(Plan::Queued {
                    reply,
                    check: Check::Update,
                    undo: None,
                })
            }
            MessageOperation::Delete {
                session_id,
                message_id,
            } => {
                validate_ids(&session_id, &message_id)?;
                let reply = pipe.del(keys::message_key(&session_id, &message_id));
                pipe.lrem(keys::session_messages_key(&session_id), 1, message_id.as_str());
                pipe.srem(keys::session_messages_index_key(&session_id), message_id);
                touched.sessions.insert(session_id);
                Ok(Plan::Queued {
                    reply,
                    check: Check::Delete,
                    undo: None,
                })
            }
        }
    }

    fn invalidate(&self, touched: &Touched) {
        for category in &touched.categories {
            self.cache.clear(Some(&keys::info_cache_scope(category)));
        }
        for session_id in &touched.sessions {
            invalidate_session(&self.cache, session_id);
        }
    }

    /// Run operations in pipelines of at most `chunk_size`
    async fn run_chunked(&self, operations: Vec<BatchOperation>) -> StorageResult<BatchReport> {
        let mut report = BatchReport::default();
        let mut remaining = operations.into_iter().peekable();
        while remaining.peek().is_some() {
            let chunk: Vec<_> = remaining.by_ref().take(self.chunk_size).map(Ok).collect();
            report.absorb(self.run(chunk).await?);
        }
        Ok(report)
    }

    async fn bulk(&self, operation: &str, operations: Vec<BatchOperation>) -> Response<BulkCounts> {
        let counts = self
            .run_chunked(operations)
            .await
            .map(|report| BulkCounts::from(&report));
        Response::from_result(operation, counts)
    }

    pub async fn bulk_create_info(&self, items: Vec<InfoInput>) -> Response<BulkCounts> {
        let ops = items
            .into_iter()
            .map(|i| BatchOperation::create_info(i.category, i.key, i.data, i.ttl))
            .collect();
        self.bulk("bulk create info", ops).await
    }

    pub async fn bulk_create_sessions(&self, sessions: Vec<SessionInput>) -> Response<BulkCounts> {
        let ops = sessions
            .into_iter()
            .map(|s| BatchOperation::create_session(s.session_id, s.metadata, s.ttl))
            .collect();
        self.bulk("bulk create sessions", ops).await
    }

    /// Create messages with generated ids
    ///
    /// Sessions are not checked for existence.
    pub async fn bulk_create_messages(&self, messages: Vec<MessageInput>) -> Response<BulkCounts> {
        let ops = messages
            .into_iter()
            .map(|m| BatchOperation::create_message(m.session_id, m.role, m.content, m.metadata))
            .collect();
        self.bulk("bulk create messages", ops).await
    }

    pub async fn bulk_delete_info(&self, category: &str, keys: Vec<String>) -> Response<BulkCounts> {
        let ops = keys
            .into_iter()
            .map(|k| BatchOperation::delete_info(category, k))
            .collect();
        self.bulk("bulk delete info", ops).await
    }

    pub async fn bulk_delete_sessions(&self, session_ids: Vec<String>) -> Response<BulkCounts> {
        let ops = session_ids.into_iter().map(BatchOperation::delete_session).collect();
        self.bulk("bulk delete sessions", ops).await
    }

    pub async fn bulk_update_info(&self, items: Vec<InfoInput>) -> Response<BulkCounts> {
        let ops = items
            .into_iter()
            .map(|i| BatchOperation::update_info(i.category, i.key, i.data, i.ttl))
            .collect();
        self.bulk("bulk update info", ops).await
    }

    /// Count primary keys by entity
    pub async fn get_batch_stats(&self) -> Response<BatchStats> {
        Response::from_result("get batch stats", self.try_stats().await)
    }

    async fn try_stats(&self) -> StorageResult<BatchStats> {
        let info_count = self
            .client
            .keys(&format!("{}:*", keys::INFO))
            .await?
            .iter()
            .filter(|k| keys::parse_info_key(k).is_some())
            .count();

        let session_space = self.client.keys(&format!("{}:*", keys::SESSION)).await?;
        let session_count = session_space
            .iter()
            .filter(|k| keys::parse_session_key(k).is_some())
            .count();
        let message_count = session_space
            .iter()
            .filter(|k| keys::parse_message_key(k).is_some())
            .count();

        Ok(BatchStats {
            info_count,
            session_count,
            message_count,
            total_keys: info_count + session_count + message_count,
        })
    }

    /// Remove index memberships whose primary key has expired
    ///
    /// Covers every category index, the session index (cascading to the
    /// expired session's messages) and each live session's message index.
    pub async fn cleanup_expired_data(&self) -> Response<CleanupReport> {
        Response::from_result("cleanup expired data", self.try_cleanup().await)
    }

    async fn try_cleanup(&self) -> StorageResult<CleanupReport> {
        let mut report = CleanupReport::default();

        let category_keys = self.client.keys(&format!("{}:*", keys::CATEGORY)).await?;
        for category_key in category_keys {
            let Some(category) = category_key.strip_prefix("c:") else {
                continue;
            };
            match self.clean_category(category).await {
                Ok(n) => report.cleaned += n,
                Err(e) => {
                    warn!(category = %category, error = %e, "Category cleanup failed");
                    report.errors += 1;
                }
            }
        }

        let live_sessions = match self.clean_session_index().await {
            Ok((n, live)) => {
                report.cleaned += n;
                live
            }
            Err(e) => {
                warn!(error = %e, "Session index cleanup failed");
                report.errors += 1;
                Vec::new()
            }
        };

        for session_id in live_sessions {
            match self.clean_message_index(&session_id).await {
                Ok(n) => report.cleaned += n,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Message index cleanup failed");
                    report.errors += 1;
                }
            }
        }

        info!(cleaned = report.cleaned, errors = report.errors, "Expired data cleaned up");
        Ok(report)
    }

    /// Members of `members` whose primary key no longer exists
    async fn missing_members(&self, members: &[String], key_of: impl Fn(&str) -> String) -> StorageResult<Vec<String>> {
        let mut pipe = self.client.pipeline();
        for member in members {
            pipe.ttl(key_of(member));
        }
        let replies = self.client.execute(pipe).await?;
        let mut missing = Vec::new();
        for (member, reply) in members.iter().zip(replies) {
            if TtlStatus::from_raw(reply.into_integer()?).is_missing() {
                missing.push(member.clone());
            }
        }
        Ok(missing)
    }

    async fn clean_category(&self, category: &str) -> StorageResult<usize> {
        let category_key = keys::category_key(category);
        let members = self.client.smembers(&category_key).await?;
        let stale = self
            .missing_members(&members, |k| keys::info_key(category, k))
            .await?;
        let mut pipe = self.client.pipeline();
        for key in &stale {
            pipe.srem(category_key.as_str(), key.as_str());
        }
        self.client.execute(pipe).await?;
        if !stale.is_empty() {
            self.cache.clear(Some(&keys::info_cache_scope(category)));
        }
        Ok(stale.len())
    }

    /// Returns the count cleaned and the ids still live
    async fn clean_session_index(&self) -> StorageResult<(usize, Vec<String>)> {
        let members = self.client.smembers(keys::SESSION_INDEX).await?;
        let stale = self.missing_members(&members, keys::session_key).await?;

        let mut pipe = self.client.pipeline();
        for session_id in &stale {
            let message_ids = self
                .client
                .smembers(&keys::session_messages_index_key(session_id))
                .await?;
            queue_cascade_delete(&mut pipe, session_id, &message_ids);
        }
        self.client.execute(pipe).await?;
        for session_id in &stale {
            invalidate_session(&self.cache, session_id);
        }

        let live = members.into_iter().filter(|id| !stale.contains(id)).collect();
        Ok((stale.len(), live))
    }

    async fn clean_message_index(&self, session_id: &str) -> StorageResult<usize> {
        let index_key = keys::session_messages_index_key(session_id);
        let members = self.client.smembers(&index_key).await?;
        let stale = self
            .missing_members(&members, |id| keys::message_key(session_id, id))
            .await?;
        let list_key = keys::session_messages_key(session_id);
        let mut pipe = self.client.pipeline();
        for id in &stale {
            pipe.srem(index_key.as_str(), id.as_str());
            pipe.lrem(list_key.as_str(), 0, id.as_str());
        }
        self.client.execute(pipe).await?;
        if !stale.is_empty() {
            self.cache.clear(Some(&keys::messages_cache_scope(session_id)));
        }
        Ok(stale.len())
    }
}

fn reconcile(check: Check, reply: Reply) -> StorageResult<(BatchOutcome, Option<String>)> {
    let applied = match check {
        Check::Create | Check::Update => reply.is_ok(),
        Check::Delete => reply.into_integer()? > 0,
    };
    let outcome = match (check, applied) {
        (Check::Create, true) => (BatchOutcome::Created, None),
        (Check::Create, false) => (BatchOutcome::Duplicate, Some("already exists".to_string())),
        (Check::Update, true) => (BatchOutcome::Updated, None),
        (Check::Delete, true) => (BatchOutcome::Deleted, None),
        (Check::Update | Check::Delete, false) => (BatchOutcome::NotFound, Some("not found".to_string())),
    };
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    async fn engine() -> (BatchEngine, StoreClient) {
        let client = StoreClient::in_memory();
        client.connect().await.unwrap();
        (BatchEngine::new(client.clone(), Cache::default(), 100), client)
    }

    #[test]
    fn test_operation_wire_format() {
        let op = BatchOperation::create_session("abc", Metadata::new(), Some(60));
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "session");
        assert_eq!(json["operation"], "create");
        assert_eq!(json["sessionId"], "abc");

        let back: BatchOperation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_descriptor_decoding() {
        let desc = BatchDescriptor {
            operation: BatchAction::Create,
            kind: EntityKind::Info,
            key: "docs:v1:intro".into(),
            data: json!({"data": "hello"}),
            ttl: Some(5),
        };
        let op = BatchOperation::try_from(desc).unwrap();
        assert_eq!(op, BatchOperation::create_info("docs", "v1:intro", "hello", Some(5)));

        let desc = BatchDescriptor {
            operation: BatchAction::Create,
            kind: EntityKind::Message,
            key: "abc".into(),
            data: json!({"role": "user", "content": "hi"}),
            ttl: None,
        };
        let op = BatchOperation::try_from(desc).unwrap();
        assert!(matches!(
            op,
            BatchOperation::Message(MessageOperation::Create { message_id: None, .. })
        ));

        let bad = BatchDescriptor {
            operation: BatchAction::Delete,
            kind: EntityKind::Info,
            key: "no-separator".into(),
            data: serde_json::Value::Null,
            ttl: None,
        };
        assert!(matches!(
            BatchOperation::try_from(bad),
            Err(StorageError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let (engine, client) = engine().await;
        let report = engine
            .execute(vec![
                BatchOperation::create_info("docs", "a", "alpha", None),
                BatchOperation::update_info("docs", "missing", "x", None),
                BatchOperation::create_session("s1", Metadata::new(), None),
            ])
            .await
            .into_result()
            .unwrap();

        assert_eq!(report.successful, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.results[1].result, BatchOutcome::NotFound);
        assert!(client.exists("i:docs:a").await.unwrap());
        assert!(client.exists("s:s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicates_and_missing_deletes_reconciled() {
        let (engine, client) = engine().await;
        engine
            .execute(vec![BatchOperation::create_info("docs", "a", "v1", None)])
            .await;

        let report = engine
            .execute(vec![
                BatchOperation::create_info("docs", "a", "v2", None),
                BatchOperation::delete_info("docs", "ghost"),
                BatchOperation::delete_session("ghost"),
            ])
            .await
            .into_result()
            .unwrap();

        let outcomes: Vec<BatchOutcome> = report.results.iter().map(|r| r.result).collect();
        assert_eq!(
            outcomes,
            vec![
                BatchOutcome::Duplicate,
                BatchOutcome::NotFound,
                BatchOutcome::NotFound
            ]
        );
        assert_eq!(report.successful, 0);
        let stored: InfoItem = client.get_json("i:docs:a").await.unwrap().unwrap();
        assert_eq!(stored.data, "v1");
    }

    #[tokio::test]
    async fn test_duplicate_message_does_not_double_list_entry() {
        let (engine, client) = engine().await;
        let create = BatchOperation::Message(MessageOperation::Create {
            session_id: "abc".into(),
            message_id: Some("m1".into()),
            role: "user".into(),
            content: "hi".into(),
            metadata: Metadata::new(),
        });
        engine.execute(vec![create.clone()]).await;
        let report = engine.execute(vec![create]).await.into_result().unwrap();

        assert_eq!(report.results[0].result, BatchOutcome::Duplicate);
        assert_eq!(client.lrange("s:abc:ms", 0, -1).await.unwrap(), vec!["m1"]);
    }

    #[tokio::test]
    async fn test_results_follow_input_order() {
        let (engine, _) = engine().await;
        let report = engine
            .execute(vec![
                BatchOperation::create_message("abc", "user", "hi", Metadata::new()),
                BatchOperation::create_session("abc", Metadata::new(), None),
                BatchOperation::create_info("docs", "a", "x", None),
            ])
            .await
            .into_result()
            .unwrap();
        let kinds: Vec<EntityKind> = report.results.iter().map(|r| r.operation.kind).collect();
        assert_eq!(
            kinds,
            vec![EntityKind::Message, EntityKind::Session, EntityKind::Info]
        );
        assert_eq!(report.successful, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_update_keeps_ttl() {
        let (engine, client) = engine().await;
        engine
            .execute(vec![BatchOperation::create_session("abc", Metadata::new(), Some(100))])
            .await;
        tokio::time::advance(Duration::from_secs(20)).await;

        let mut updates = Metadata::new();
        updates.insert("stage".into(), json!("checkout"));
        let report = engine
            .execute(vec![BatchOperation::update_session("abc", updates)])
            .await
            .into_result()
            .unwrap();
        assert_eq!(report.results[0].result, BatchOutcome::Updated);

        assert_eq!(client.ttl("s:abc").await.unwrap(), TtlStatus::Expires(80));
        let stored: Session = client.get_json("s:abc").await.unwrap().unwrap();
        assert_eq!(stored.metadata["stage"], json!("checkout"));
    }

    #[tokio::test]
    async fn test_session_delete_cascades() {
        let (engine, client) = engine().await;
        engine
            .execute(vec![
                BatchOperation::create_session("abc", Metadata::new(), None),
                BatchOperation::Message(MessageOperation::Create {
                    session_id: "abc".into(),
                    message_id: Some("m1".into()),
                    role: "user".into(),
                    content: "hi".into(),
                    metadata: Metadata::new(),
                }),
            ])
            .await;
        assert!(client.exists("s:abc:m:m1").await.unwrap());

        let report = engine
            .execute(vec![BatchOperation::delete_session("abc")])
            .await
            .into_result()
            .unwrap();
        assert_eq!(report.results[0].result, BatchOutcome::Deleted);
        for key in ["s:abc", "s:abc:m:m1", "s:abc:ms", "s:abc:ms:index"] {
            assert!(!client.exists(key).await.unwrap(), "{} survived", key);
        }
    }

    #[tokio::test]
    async fn test_ids_with_separator_rejected_before_queueing() {
        let (engine, client) = engine().await;
        engine
            .execute(vec![
                BatchOperation::create_info("docs", "x:y", "v", None),
                BatchOperation::create_session("x", Metadata::new(), None),
                BatchOperation::Message(MessageOperation::Create {
                    session_id: "x".into(),
                    message_id: Some("m1".into()),
                    role: "user".into(),
                    content: "hi".into(),
                    metadata: Metadata::new(),
                }),
            ])
            .await;

        let report = engine
            .execute(vec![
                BatchOperation::delete_info("docs:x", "y"),
                BatchOperation::update_info("docs:x", "y", "w", None),
                BatchOperation::delete_session("x:ms:index"),
                BatchOperation::update_session("x:ms", Metadata::new()),
                BatchOperation::delete_message("x:ms", "index"),
                BatchOperation::update_message("x", "m:1", MessageUpdate::content("w")),
            ])
            .await
            .into_result()
            .unwrap();

        assert_eq!(report.successful, 0);
        assert_eq!(report.failed, 6);
        for result in &report.results {
            assert_eq!(result.result, BatchOutcome::Error);
            assert!(result.error.as_deref().unwrap().contains("Invalid input"));
        }
        assert!(client.exists("i:docs:x:y").await.unwrap());
        assert_eq!(client.smembers("c:docs").await.unwrap(), vec!["x:y".to_string()]);
        assert_eq!(client.smembers("s:x:ms:index").await.unwrap(), vec!["m1".to_string()]);
        assert!(client.exists("s:x:m:m1").await.unwrap());
    }

    #[tokio::test]
    async fn test_descriptor_failures_keep_position() {
        let (engine, _) = engine().await;
        let descriptors: Vec<BatchDescriptor> = serde_json::from_value(json!([
            {"operation": "create", "type": "session", "key": "abc", "data": {"metadata": {"a": 1}}},
            {"operation": "create", "type": "message", "key": "abc:m1", "data": {"role": "user"}},
            {"operation": "create", "type": "info", "key": "docs:a", "data": {"data": "x"}, "ttl": 60}
        ]))
        .unwrap();

        let report = engine.execute_descriptors(descriptors).await.into_result().unwrap();
        assert_eq!(report.successful, 2);
        assert_eq!(report.results[1].result, BatchOutcome::Error);
        assert!(report.results[1].error.as_deref().unwrap().contains("content"));
    }

    #[tokio::test]
    async fn test_bulk_wrappers_chunk() {
        let client = StoreClient::in_memory();
        client.connect().await.unwrap();
        let engine = BatchEngine::new(client.clone(), Cache::default(), 2);

        let items: Vec<InfoInput> = (0..5)
            .map(|i| InfoInput {
                category: "docs".into(),
                key: format!("k{}", i),
                data: "v".into(),
                ttl: None,
            })
            .collect();
        let counts = engine.bulk_create_info(items.clone()).await.into_result().unwrap();
        assert_eq!(counts, BulkCounts { succeeded: 5, failed: 0 });

        let counts = engine.bulk_update_info(items).await.into_result().unwrap();
        assert_eq!(counts.succeeded, 5);

        let counts = engine
            .bulk_delete_info("docs", vec!["k0".into(), "nope".into()])
            .await
            .into_result()
            .unwrap();
        assert_eq!(counts, BulkCounts { succeeded: 1, failed: 1 });
        assert_eq!(client.smembers("c:docs").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_bulk_sessions_and_messages() {
        let (engine, client) = engine().await;
        let counts = engine
            .bulk_create_sessions(vec![
                SessionInput {
                    session_id: "a".into(),
                    metadata: Metadata::new(),
                    ttl: None,
                },
                SessionInput {
                    session_id: "b".into(),
                    metadata: Metadata::new(),
                    ttl: Some(60),
                },
            ])
            .await
            .into_result()
            .unwrap();
        assert_eq!(counts.succeeded, 2);

        let messages = (0..3)
            .map(|i| MessageInput {
                session_id: "a".into(),
                role: "user".into(),
                content: format!("m{}", i),
                metadata: Metadata::new(),
            })
            .collect();
        let counts = engine.bulk_create_messages(messages).await.into_result().unwrap();
        assert_eq!(counts.succeeded, 3);
        assert_eq!(client.llen("s:a:ms").await.unwrap(), 3);

        let counts = engine
            .bulk_delete_sessions(vec!["a".into(), "b".into()])
            .await
            .into_result()
            .unwrap();
        assert_eq!(counts.succeeded, 2);
        assert!(client.keys("s:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_stats() {
        let (engine, _) = engine().await;
        engine
            .execute(vec![
                BatchOperation::create_info("docs", "a", "x", None),
                BatchOperation::create_info("faq", "b", "y", None),
                BatchOperation::create_session("abc", Metadata::new(), None),
                BatchOperation::create_message("abc", "user", "hi", Metadata::new()),
                BatchOperation::create_message("abc", "user", "yo", Metadata::new()),
            ])
            .await;

        let stats = engine.get_batch_stats().await.into_result().unwrap();
        assert_eq!(
            stats,
            BatchStats {
                info_count: 2,
                session_count: 1,
                message_count: 2,
                total_keys: 5
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired_data() {
        let (engine, client) = engine().await;
        engine
            .execute(vec![
                BatchOperation::create_info("docs", "short", "x", Some(5)),
                BatchOperation::create_info("docs", "long", "y", None),
                BatchOperation::create_session("gone", Metadata::new(), Some(5)),
                BatchOperation::create_session("kept", Metadata::new(), None),
            ])
            .await;
        client.sadd("s:kept:ms:index", "orphan").await.unwrap();
        client.lpush("s:kept:ms", "orphan").await.unwrap();
        // the category index outlives the short item once it is re-armed
        client.expire("c:docs", 600).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;

        let report = engine.cleanup_expired_data().await.into_result().unwrap();
        assert_eq!(report, CleanupReport { cleaned: 3, errors: 0 });
        assert_eq!(client.smembers("c:docs").await.unwrap(), vec!["long"]);
        assert_eq!(client.smembers(keys::SESSION_INDEX).await.unwrap(), vec!["kept"]);
        assert_eq!(client.llen("s:kept:ms").await.unwrap(), 0);
    }
}
