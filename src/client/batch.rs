//! Batch orchestration: chunking, dispatch and key-based reassembly.

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::models::{
    BatchBody, BatchRequest, BatchResult, Command, CommandKey, ItemResult, MethodName,
    ResponseData, Time, MAX_BATCH_SIZE,
};
use crate::{Error, Result};

use super::http::ClientInner;

/// Service for executing many commands through the `batch` method.
///
/// # Example
///
/// ```no_run
/// use bitrix24_rs::{Bitrix24Client, Command, Credentials};
/// use serde_json::json;
///
/// # async fn example(client: Bitrix24Client) -> bitrix24_rs::Result<()> {
/// let commands = (1..=120)
///     .map(|id| Command::new(format!("deal_{}", id), "crm.deal.get", json!({"id": id})))
///     .collect();
///
/// let results = client.batch().execute(commands, false).await?;
/// for (key, error) in results.failures() {
///     eprintln!("{} failed: {}", key, error);
/// }
/// # Ok(())
/// # }
/// ```
pub struct BatchService {
    inner: Arc<ClientInner>,
}

impl BatchService {
    pub(crate) fn new(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    /// Execute commands in chunks of at most [`MAX_BATCH_SIZE`].
    ///
    /// Results are matched to commands by key. With `halt_on_error` the
    /// portal stops at the first failing command: later commands of that
    /// chunk have no entry and later chunks are not sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] before any request is sent if the
    /// command list is malformed. Failures after that are reported per
    /// command in the [`BatchResult`].
    pub async fn execute(&self, commands: Vec<Command>, halt_on_error: bool) -> Result<BatchResult> {
        let request = BatchRequest::new(commands, halt_on_error)?;
        self.inner.execute_batch(&request).await
    }

    /// Execute a prepared request.
    pub async fn execute_request(&self, request: &BatchRequest) -> Result<BatchResult> {
        self.inner.execute_batch(request).await
    }

    /// Create one entity per item with `method` (e.g. `crm.contact.add`).
    ///
    /// Each item is sent as `{"fields": item}` and keyed by its position.
    pub async fn add_entity_items(&self, method: &str, items: Vec<Value>) -> Result<BatchResult> {
        let commands = items
            .into_iter()
            .enumerate()
            .map(|(index, fields)| Command::new(index, method, json!({ "fields": fields })))
            .collect();
        self.execute(commands, false).await
    }

    /// Update entities with `method` (e.g. `crm.contact.update`).
    ///
    /// Each `(id, fields)` pair is sent as `{"id": id, "fields": fields}`
    /// and keyed by the id.
    pub async fn update_entity_items(
        &self,
        method: &str,
        items: Vec<(u64, Value)>,
    ) -> Result<BatchResult> {
        let commands = items
            .into_iter()
            .map(|(id, fields)| {
                Command::new(id.to_string(), method, json!({ "id": id, "fields": fields }))
            })
            .collect();
        self.execute(commands, false).await
    }

    /// Delete entities with `method` (e.g. `crm.contact.delete`), keyed by id.
    pub async fn delete_entity_items(&self, method: &str, ids: Vec<u64>) -> Result<BatchResult> {
        let commands = ids
            .into_iter()
            .map(|id| Command::new(id.to_string(), method, json!({ "id": id })))
            .collect();
        self.execute(commands, false).await
    }
}

impl ClientInner {
    pub(crate) async fn execute_batch(&self, request: &BatchRequest) -> Result<BatchResult> {
        let halt = request.halt_on_error();
        let chunk_count = request.chunk_count();
        debug!(commands = request.len(), chunks = chunk_count, halt, "batch started");

        let mut result = BatchResult::with_capacity(request.len());
        let concurrency = self.config.max_concurrent_chunks;

        if halt || concurrency <= 1 {
            for (index, chunk) in request.chunks().enumerate() {
                let outcome = self.dispatch_chunk(chunk, halt).await;
                let failed = absorb_chunk(chunk, outcome, halt, &mut result);
                if failed && halt {
                    debug!(
                        chunk = index,
                        skipped_chunks = chunk_count - index - 1,
                        "batch halted"
                    );
                    break;
                }
            }
        } else {
            let this = self;
            let outcomes: Vec<_> = stream::iter(request.chunks())
                .map(move |chunk| async move { (chunk, this.dispatch_chunk(chunk, false).await) })
                .buffered(concurrency)
                .collect()
                .await;
            for (chunk, outcome) in outcomes {
                absorb_chunk(chunk, outcome, false, &mut result);
            }
        }

        debug!(
            results = result.len(),
            succeeded = result.success_count(),
            "batch finished"
        );
        Ok(result)
    }

    /// Send one physical `batch` call for at most [`MAX_BATCH_SIZE`] commands.
    pub(crate) async fn dispatch_chunk(
        &self,
        chunk: &[Command],
        halt_on_error: bool,
    ) -> Result<ResponseData> {
        if chunk.len() > MAX_BATCH_SIZE {
            return Err(Error::Validation(format!(
                "Batch chunk of {} commands exceeds the limit of {}",
                chunk.len(),
                MAX_BATCH_SIZE
            )));
        }
        let body = BatchBody::new(chunk, halt_on_error);
        self.call_raw(&MethodName::batch(), &body).await
    }
}

/// Record the outcome of one chunk. Returns `true` if anything failed.
///
/// Without halt every command must come back; a missing one is recorded as
/// failed. With halt, commands after the failing one are left out.
fn absorb_chunk(
    chunk: &[Command],
    outcome: Result<ResponseData>,
    halt: bool,
    result: &mut BatchResult,
) -> bool {
    let mut payload = match outcome.and_then(|response| BatchPayload::parse(response.result)) {
        Ok(payload) => payload,
        Err(err) => {
            debug!(commands = chunk.len(), error = %err, "batch chunk failed");
            let shared = Arc::new(err);
            for command in chunk {
                result.insert(command.key.clone(), ItemResult::Failed(shared.clone()));
            }
            return true;
        }
    };

    let mut failed = false;
    for command in chunk {
        match payload.take(&command.key) {
            Some(Ok(response)) => result.insert(command.key.clone(), ItemResult::Success(response)),
            Some(Err(err)) => {
                failed = true;
                result.insert(command.key.clone(), ItemResult::Failed(Arc::new(err)));
            }
            None if halt => {}
            None => {
                failed = true;
                let err = Error::InvalidResponse(format!(
                    "Batch response has no result for {}",
                    command.key
                ));
                result.insert(command.key.clone(), ItemResult::Failed(Arc::new(err)));
            }
        }
    }
    failed
}

/// The `result` of a `batch` call, split into its keyed maps.
///
/// The portal encodes a map with numeric keys as a JSON array, so every
/// part may arrive as either shape.
#[derive(Debug, Default)]
pub(crate) struct BatchPayload {
    results: Map<String, Value>,
    errors: Map<String, Value>,
    totals: Map<String, Value>,
    nexts: Map<String, Value>,
    times: Map<String, Value>,
}

impl BatchPayload {
    pub(crate) fn parse(result: Value) -> Result<Self> {
        let mut parts = match result {
            Value::Object(parts) => parts,
            other => {
                return Err(Error::InvalidResponse(format!(
                    "Expected a batch result object, got {}",
                    other
                )))
            }
        };

        let mut part = |name: &str| keyed(parts.remove(name).unwrap_or(Value::Null));
        Ok(Self {
            results: part("result"),
            errors: part("result_error"),
            totals: part("result_total"),
            nexts: part("result_next"),
            times: part("result_time"),
        })
    }

    /// Remove the outcome of one command. `None` if the portal never ran it.
    pub(crate) fn take(&mut self, key: &CommandKey) -> Option<Result<ResponseData>> {
        let key = key.as_str();
        if let Some(body) = self.errors.remove(key) {
            self.results.remove(key);
            return Some(Err(Error::from_api_response(None, body)));
        }

        let result = self.results.remove(key)?;
        Some(Ok(ResponseData {
            result,
            total: self.totals.remove(key).as_ref().and_then(as_offset),
            next: self.nexts.remove(key).as_ref().and_then(as_offset),
            time: self
                .times
                .remove(key)
                .and_then(|time| serde_json::from_value::<Time>(time).ok()),
        }))
    }
}

fn keyed(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| (index.to_string(), item))
            .collect(),
        _ => Map::new(),
    }
}

fn as_offset(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}
