//! Commands, batch requests and their keyed results.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::Serialize;
use serde_json::Value;

use super::primitives::{CommandKey, MethodName};
use super::query::build_query;
use super::response::ResponseData;
use crate::{Error, Result};

/// Maximum number of commands the portal accepts in one `batch` call.
pub const MAX_BATCH_SIZE: usize = 50;

/// One logical API call inside a batch.
///
/// # Example
///
/// ```
/// use bitrix24_rs::Command;
/// use serde_json::json;
///
/// let command = Command::new("deal_7", "crm.deal.get", json!({"id": 7}));
/// assert_eq!(command.to_query(), "crm.deal.get?id=7");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Caller-supplied key
    pub key: CommandKey,
    /// REST method name
    pub method: String,
    /// Method parameters, an object or `null`
    pub params: Value,
}

impl Command {
    /// Create a new command.
    pub fn new(key: impl Into<CommandKey>, method: impl Into<String>, params: Value) -> Self {
        Self {
            key: key.into(),
            method: method.into(),
            params,
        }
    }

    /// Render the command in the `method?query` form used by `batch`.
    pub fn to_query(&self) -> String {
        format!("{}?{}", self.method.trim(), build_query(&self.params))
    }

    fn validate(&self) -> Result<()> {
        if self.key.as_str().trim().is_empty() {
            return Err(Error::Validation("Command key is empty".to_string()));
        }
        let method = MethodName::new(self.method.as_str())
            .map_err(|e| Error::Validation(format!("Command {}: {}", self.key, e)))?;
        if method.is_batch() {
            return Err(Error::Validation(format!(
                "Command {}: batch calls cannot be nested",
                self.key
            )));
        }
        if !matches!(self.params, Value::Object(_) | Value::Null) {
            return Err(Error::Validation(format!(
                "Command {}: params must be an object",
                self.key
            )));
        }
        Ok(())
    }
}

/// A validated, ordered set of commands ready to be chunked.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    commands: Vec<Command>,
    halt_on_error: bool,
}

impl BatchRequest {
    /// Validate the commands and build a request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty command list, empty or
    /// duplicate keys, invalid method names, nested `batch` calls and
    /// non-object params.
    pub fn new(commands: Vec<Command>, halt_on_error: bool) -> Result<Self> {
        if commands.is_empty() {
            return Err(Error::Validation("Batch has no commands".to_string()));
        }

        let mut seen = HashSet::with_capacity(commands.len());
        for command in &commands {
            command.validate()?;
            if !seen.insert(command.key.as_str()) {
                return Err(Error::Validation(format!(
                    "Duplicate command key: {}",
                    command.key
                )));
            }
        }

        Ok(Self {
            commands,
            halt_on_error,
        })
    }

    /// Commands in caller order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Whether the portal should stop at the first failing command.
    pub fn halt_on_error(&self) -> bool {
        self.halt_on_error
    }

    /// Number of commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Always `false`; an empty request cannot be built.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Contiguous chunks of at most [`MAX_BATCH_SIZE`] commands.
    pub fn chunks(&self) -> impl Iterator<Item = &[Command]> {
        self.commands.chunks(MAX_BATCH_SIZE)
    }

    /// Number of physical `batch` calls this request needs.
    pub fn chunk_count(&self) -> usize {
        self.commands.len().div_ceil(MAX_BATCH_SIZE)
    }
}

/// Body of one physical `batch` call.
#[derive(Serialize)]
pub(crate) struct BatchBody<'a> {
    halt: u8,
    cmd: CommandMap<'a>,
}

impl<'a> BatchBody<'a> {
    pub(crate) fn new(chunk: &'a [Command], halt_on_error: bool) -> Self {
        Self {
            halt: u8::from(halt_on_error),
            cmd: CommandMap(chunk),
        }
    }
}

/// Serializes commands as a `key → "method?query"` object in list order.
struct CommandMap<'a>(&'a [Command]);

impl Serialize for CommandMap<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for command in self.0 {
            map.serialize_entry(command.key.as_str(), &command.to_query())?;
        }
        map.end()
    }
}

/// The outcome of one command.
#[derive(Debug, Clone)]
pub enum ItemResult {
    /// The command succeeded.
    Success(ResponseData),
    /// The command, or the whole chunk it was sent in, failed.
    Failed(Arc<Error>),
}

impl ItemResult {
    /// Returns `true` for a successful command.
    pub fn is_success(&self) -> bool {
        matches!(self, ItemResult::Success(_))
    }

    /// The response of a successful command.
    pub fn response(&self) -> Option<&ResponseData> {
        match self {
            ItemResult::Success(response) => Some(response),
            ItemResult::Failed(_) => None,
        }
    }

    /// The error of a failed command.
    pub fn error(&self) -> Option<&Error> {
        match self {
            ItemResult::Success(_) => None,
            ItemResult::Failed(err) => Some(err),
        }
    }

    /// Convert into a `Result`, naming the command on failure.
    pub fn into_result(self, key: &CommandKey) -> Result<ResponseData> {
        match self {
            ItemResult::Success(response) => Ok(response),
            ItemResult::Failed(source) => Err(Error::Command {
                key: key.to_string(),
                source,
            }),
        }
    }
}

/// Per-command results of a batch, in original command order.
///
/// A command has no entry when the portal never ran it (halt mode).
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    entries: Vec<(CommandKey, ItemResult)>,
    index: HashMap<CommandKey, usize>,
}

impl BatchResult {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
        }
    }

    pub(crate) fn insert(&mut self, key: CommandKey, result: ItemResult) {
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push((key, result));
    }

    /// Result for a key, `None` if the command produced no result.
    pub fn get(&self, key: impl Into<CommandKey>) -> Option<&ItemResult> {
        self.index
            .get(&key.into())
            .map(|&position| &self.entries[position].1)
    }

    /// Whether a command produced a result.
    pub fn contains(&self, key: impl Into<CommandKey>) -> bool {
        self.index.contains_key(&key.into())
    }

    /// Number of commands with a result.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no command produced a result.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate results in original command order.
    pub fn iter(&self) -> impl Iterator<Item = (&CommandKey, &ItemResult)> {
        self.entries.iter().map(|(key, result)| (key, result))
    }

    /// Keys with a result, in original command order.
    pub fn keys(&self) -> impl Iterator<Item = &CommandKey> {
        self.entries.iter().map(|(key, _)| key)
    }

    /// Number of successful commands.
    pub fn success_count(&self) -> usize {
        self.entries.iter().filter(|(_, r)| r.is_success()).count()
    }

    /// Failed commands and their errors.
    pub fn failures(&self) -> impl Iterator<Item = (&CommandKey, &Error)> {
        self.entries
            .iter()
            .filter_map(|(key, result)| result.error().map(|err| (key, err)))
    }
}

impl IntoIterator for BatchResult {
    type Item = (CommandKey, ItemResult);
    type IntoIter = std::vec::IntoIter<(CommandKey, ItemResult)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn commands(count: usize) -> Vec<Command> {
        (0..count)
            .map(|i| Command::new(format!("c{}", i), "crm.deal.get", json!({"id": i})))
            .collect()
    }

    #[test]
    fn test_chunking() {
        let request = BatchRequest::new(commands(137), false).unwrap();
        let sizes: Vec<usize> = request.chunks().map(<[Command]>::len).collect();
        assert_eq!(sizes, vec![50, 50, 37]);
        assert_eq!(request.chunk_count(), 3);

        let exact = BatchRequest::new(commands(50), false).unwrap();
        assert_eq!(exact.chunk_count(), 1);
    }

    #[test]
    fn test_rejects_duplicate_keys() {
        let mut list = commands(3);
        list.push(Command::new("c1", "crm.deal.get", json!({"id": 1})));
        match BatchRequest::new(list, false) {
            Err(Error::Validation(message)) => assert!(message.contains("c1")),
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_malformed_commands() {
        assert!(BatchRequest::new(Vec::new(), false).is_err());
        assert!(BatchRequest::new(vec![Command::new("", "crm.deal.get", Value::Null)], false).is_err());
        assert!(BatchRequest::new(vec![Command::new("a", "", Value::Null)], false).is_err());
        assert!(BatchRequest::new(vec![Command::new("a", "batch", json!({}))], false).is_err());
        assert!(BatchRequest::new(vec![Command::new("a", "crm.deal.get", json!([1]))], false).is_err());
    }

    #[test]
    fn test_body_preserves_command_order() {
        let chunk = vec![
            Command::new("zeta", "user.current", Value::Null),
            Command::new("alpha", "crm.deal.get", json!({"id": 1})),
        ];
        let body = serde_json::to_string(&BatchBody::new(&chunk, true)).unwrap();
        assert_eq!(
            body,
            r#"{"halt":1,"cmd":{"zeta":"user.current?","alpha":"crm.deal.get?id=1"}}"#
        );
    }

    #[test]
    fn test_batch_result_lookup() {
        let mut result = BatchResult::with_capacity(2);
        result.insert("b".into(), ItemResult::Success(ResponseData::new(json!(1))));
        result.insert(
            "a".into(),
            ItemResult::Failed(Arc::new(Error::Validation("x".into()))),
        );

        assert_eq!(result.len(), 2);
        assert!(result.get("b").unwrap().is_success());
        assert!(result.get("a").unwrap().error().is_some());
        assert!(result.get("missing").is_none());
        assert_eq!(result.success_count(), 1);
        let keys: Vec<&str> = result.keys().map(CommandKey::as_str).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }
}
