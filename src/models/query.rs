//! List query parameters and the nested form encoding used inside batch
//! commands.

use serde::Serialize;
use serde_json::{Map, Value};
use url::form_urlencoded::byte_serialize;

/// Filter, order and select parameters of a list method.
///
/// # Example
///
/// ```
/// use bitrix24_rs::ListQuery;
/// use serde_json::json;
///
/// let query = ListQuery::new()
///     .filter(json!({">OPPORTUNITY": 1000, "STAGE_ID": "NEW"}))
///     .order(json!({"ID": "ASC"}))
///     .select(["ID", "TITLE"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListQuery {
    /// `filter` parameter
    pub filter: Map<String, Value>,
    /// `order` parameter
    pub order: Map<String, Value>,
    /// `select` parameter
    pub select: Vec<String>,
    /// Additional method-specific parameters
    pub extra: Map<String, Value>,
    /// Field of `result` holding the item array, for methods that wrap
    /// their items (`crm.item.list` → `items`, `tasks.task.list` → `tasks`).
    pub result_key: Option<String>,
}

impl ListQuery {
    /// Create an empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the filter. Non-object values are ignored.
    pub fn filter(mut self, filter: Value) -> Self {
        if let Value::Object(map) = filter {
            self.filter = map;
        }
        self
    }

    /// Set the order. Non-object values are ignored.
    pub fn order(mut self, order: Value) -> Self {
        if let Value::Object(map) = order {
            self.order = map;
        }
        self
    }

    /// Set the selected fields.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Add a method-specific parameter.
    pub fn param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }

    /// Read items from `result[key]` instead of `result`.
    pub fn result_key(mut self, key: impl Into<String>) -> Self {
        self.result_key = Some(key.into());
        self
    }

    /// Build call parameters for the page starting at `start`.
    pub(crate) fn to_params(&self, start: i64) -> Value {
        let mut params = self.extra.clone();
        if !self.filter.is_empty() {
            params.insert("filter".to_string(), Value::Object(self.filter.clone()));
        }
        if !self.order.is_empty() {
            params.insert("order".to_string(), Value::Object(self.order.clone()));
        }
        if !self.select.is_empty() {
            params.insert(
                "select".to_string(),
                Value::Array(self.select.iter().cloned().map(Value::String).collect()),
            );
        }
        params.insert("start".to_string(), Value::from(start));
        Value::Object(params)
    }

    /// Extract the item array of one page from a `result` value.
    pub(crate) fn items_of(&self, result: Value) -> crate::Result<Vec<Value>> {
        let list = match &self.result_key {
            Some(key) => match result {
                Value::Object(mut map) => map.remove(key).unwrap_or(Value::Null),
                other => other,
            },
            None => result,
        };
        match list {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            // keyed object instead of a list
            Value::Object(map) => Ok(map.into_iter().map(|(_, v)| v).collect()),
            other => Err(crate::Error::InvalidResponse(format!(
                "Expected a list of items, got {}",
                other
            ))),
        }
    }
}

impl Serialize for ListQuery {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_params(0).serialize(serializer)
    }
}

/// Encode parameters as a nested form query string.
///
/// Nested objects and arrays become bracketed keys
/// (`filter[>ID]=5&select[0]=ID`), booleans become `1`/`0` and nulls are
/// skipped, which is how the portal parses a command inside `batch`.
pub fn build_query(params: &Value) -> String {
    let mut pairs = Vec::new();
    match params {
        Value::Object(map) => {
            for (key, value) in map {
                collect_pairs(key, value, &mut pairs);
            }
        }
        Value::Array(items) => {
            for (index, value) in items.iter().enumerate() {
                collect_pairs(&index.to_string(), value, &mut pairs);
            }
        }
        _ => {}
    }

    pairs
        .iter()
        .map(|(key, value)| format!("{}={}", encode(key), encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

fn collect_pairs(prefix: &str, value: &Value, pairs: &mut Vec<(String, String)>) {
    match value {
        Value::Null => {}
        Value::Bool(flag) => pairs.push((prefix.to_string(), if *flag { "1" } else { "0" }.to_string())),
        Value::Number(number) => pairs.push((prefix.to_string(), number.to_string())),
        Value::String(text) => pairs.push((prefix.to_string(), text.clone())),
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                collect_pairs(&format!("{}[{}]", prefix, index), item, pairs);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                collect_pairs(&format!("{}[{}]", prefix, key), item, pairs);
            }
        }
    }
}

fn encode(raw: &str) -> String {
    byte_serialize(raw.as_bytes()).collect()
}
