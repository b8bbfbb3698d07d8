//! Data models for the request orchestration layer.
//!
//! - [`primitives`] - Core newtypes like `CommandKey` and `MethodName`
//! - [`response`] - `ResponseData`, `Pagination` and server timing
//! - [`batch`] - Commands, batch requests and keyed batch results
//! - [`query`] - List query parameters and nested form encoding

pub mod primitives;
pub mod response;
pub mod batch;
pub mod query;

// Re-export commonly used types
pub use primitives::*;
pub use response::*;
pub use batch::*;
pub use query::{build_query, ListQuery};
