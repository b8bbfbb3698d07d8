//! # bitrix24-rs
//!
//! An async Rust client for the Bitrix24 REST API.
//!
//! This crate wraps the portal's REST interface with the three things every
//! non-trivial integration ends up needing: batching many calls into few
//! round trips, reading large lists without loading them into memory, and
//! renewing OAuth access tokens transparently.
//!
//! ## Features
//!
//! - **Authentication**: incoming webhooks and OAuth applications with
//!   single-flight refresh-token renewal
//! - **Batching**: any number of commands, chunked into `batch` calls of 50
//!   and matched back to their results by key
//! - **Bulk reads**: lazy streams over list methods with direct,
//!   batch-assisted and keyset pagination
//! - **Async-first**: built on Tokio and `reqwest`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bitrix24_rs::{Bitrix24Client, Credentials};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> bitrix24_rs::Result<()> {
//!     let client = Bitrix24Client::new(Credentials::webhook(
//!         "https://example.bitrix24.com/rest/1/s3cr3t/",
//!     )?)?;
//!
//!     let user = client.call("user.current", json!({})).await?;
//!     println!("{}", user.result);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Batching
//!
//! ```rust,no_run
//! use bitrix24_rs::{Bitrix24Client, Command};
//! use serde_json::json;
//!
//! # async fn example(client: Bitrix24Client) -> bitrix24_rs::Result<()> {
//! let commands = (1..=137)
//!     .map(|id| Command::new(format!("deal_{}", id), "crm.deal.get", json!({"id": id})))
//!     .collect();
//!
//! // 3 round trips: 50 + 50 + 37 commands
//! let results = client.batch().execute(commands, false).await?;
//! if let Some(deal) = results.get("deal_42").and_then(|r| r.response()) {
//!     println!("{}", deal.result);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Bulk Reads
//!
//! ```rust,no_run
//! use bitrix24_rs::{Bitrix24Client, ReadStrategy};
//! use futures_util::StreamExt;
//! use serde::Deserialize;
//! use serde_json::json;
//!
//! #[derive(Deserialize)]
//! struct Contact {
//!     #[serde(rename = "ID")]
//!     id: String,
//!     #[serde(rename = "NAME")]
//!     name: Option<String>,
//! }
//!
//! # async fn example(client: Bitrix24Client) -> bitrix24_rs::Result<()> {
//! let mut contacts = client
//!     .items("crm.contact.list")
//!     .filter(json!({"TYPE_ID": "CLIENT"}))
//!     .select(["ID", "NAME"])
//!     .strategy(ReadStrategy::id_cursor("ID"))
//!     .stream::<Contact>();
//!
//! while let Some(contact) = contacts.next().await {
//!     let contact = contact?;
//!     println!("{} {:?}", contact.id, contact.name);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod auth;
pub mod client;
pub mod error;
pub mod models;

// Re-export primary types at crate root for convenience
pub use auth::{AuthToken, Credentials, RenewalState, RenewedAuthToken, TokenSink};
pub use client::{
    BatchService, Bitrix24Client, ClientConfig, ItemsReader, PaginatedStream, ReadStrategy,
    RetryConfig,
};
pub use error::{ApiErrorCode, Error, Result};
pub use models::{
    BatchRequest, BatchResult, Command, CommandKey, ItemResult, ListQuery, MethodName,
    ResponseData, MAX_BATCH_SIZE,
};

/// Prelude module for convenient imports.
///
/// ```rust
/// use bitrix24_rs::prelude::*;
/// ```
pub mod prelude {
    pub use crate::auth::{
        ApplicationProfile, AuthToken, Credentials, Endpoints, RenewalState, RenewedAuthToken,
        Scope, TokenSink,
    };
    pub use crate::client::{
        Bitrix24Client, ClientConfig, ItemsReader, PaginatedStream, ReadStrategy, RetryConfig,
    };
    pub use crate::error::{ApiErrorCode, Error, Result};
    pub use crate::models::{
        BatchResult, Command, CommandKey, ItemResult, ListQuery, ResponseData, MAX_BATCH_SIZE,
    };
}
