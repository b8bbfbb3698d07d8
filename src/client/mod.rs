//! HTTP client and service layer for the Bitrix24 REST API.
//!
//! This module provides the main entry point [`Bitrix24Client`] for
//! interacting with a Bitrix24 portal.
//!
//! # Example
//!
//! ```no_run
//! use bitrix24_rs::{Bitrix24Client, Command, Credentials};
//! use serde_json::json;
//!
//! # async fn example() -> bitrix24_rs::Result<()> {
//! let client = Bitrix24Client::new(Credentials::webhook_from_env()?)?;
//!
//! // Single call
//! let profile = client.call("profile", json!({})).await?;
//!
//! // Many calls in one round trip
//! let results = client
//!     .batch()
//!     .execute(
//!         vec![
//!             Command::new("user", "user.current", json!({})),
//!             Command::new("deal", "crm.deal.get", json!({"id": 7})),
//!         ],
//!         false,
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod batch;
mod config;
mod http;
pub mod paginated;

pub use batch::BatchService;
pub use config::{ClientConfig, RetryConfig};
pub use http::Bitrix24Client;
pub use paginated::{ItemsReader, PaginatedStream, ReadStrategy, DEFAULT_PAGE_SIZE};
