//! Response model shared by single calls, batch commands and list pages.

use chrono::{DateTime, FixedOffset};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Result;

/// The payload of one successful REST call.
///
/// List methods fill `total` and `next`; everything else only carries
/// `result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseData {
    /// The raw `result` value.
    #[serde(default)]
    pub result: Value,
    /// Total number of records matching a list query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// Offset of the next page, absent on the last page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<u64>,
    /// Server-side timing information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Time>,
}

impl ResponseData {
    /// Wrap a bare result value.
    pub fn new(result: Value) -> Self {
        Self {
            result,
            total: None,
            next: None,
            time: None,
        }
    }

    /// Deserialize `result` into a concrete type.
    pub fn result_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.result.clone())?)
    }

    /// Consume the response and deserialize `result`.
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_value(self.result)?)
    }

    /// Pagination metadata derived from `total` and `next`.
    pub fn pagination(&self) -> Pagination {
        Pagination::from_parts(self.total, self.next)
    }
}

/// Pagination metadata of a list response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pagination {
    /// Total number of records across all pages.
    pub total: u64,
    /// Offset the next page starts at; equals `total` when exhausted.
    pub next_offset: u64,
    /// Whether the portal reported a further page.
    pub has_more: bool,
}

impl Pagination {
    /// Build pagination from the raw `total` / `next` fields.
    pub fn from_parts(total: Option<u64>, next: Option<u64>) -> Self {
        let total = total.unwrap_or_default();
        match next {
            Some(next) => Self {
                total,
                next_offset: next,
                has_more: true,
            },
            None => Self {
                total,
                next_offset: total,
                has_more: false,
            },
        }
    }
}

/// Server-side timing block attached to every response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Time {
    /// Unix timestamp (with fraction) when processing started
    #[serde(default)]
    pub start: Option<f64>,
    /// Unix timestamp (with fraction) when processing finished
    #[serde(default)]
    pub finish: Option<f64>,
    /// Wall time in seconds
    #[serde(default)]
    pub duration: Option<f64>,
    /// Time spent in the method itself, in seconds
    #[serde(default)]
    pub processing: Option<f64>,
    /// Processing start as a date
    #[serde(default)]
    pub date_start: Option<DateTime<FixedOffset>>,
    /// Processing finish as a date
    #[serde(default)]
    pub date_finish: Option<DateTime<FixedOffset>>,
    /// Seconds of the per-method operating budget already used
    #[serde(default)]
    pub operating: Option<f64>,
    /// Unix timestamp at which the operating budget resets
    #[serde(default)]
    pub operating_reset_at: Option<i64>,
}
