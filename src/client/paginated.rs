//! Paginated stream for lazy iteration over list methods.
//!
//! [`ItemsReader`] builds a [`PaginatedStream`] that yields the items of a
//! list method one by one, fetching the next page only when the current
//! one is exhausted.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::batch::BatchPayload;
use super::http::ClientInner;
use crate::models::{Command, ListQuery, MethodName, MAX_BATCH_SIZE};
use crate::{Error, Result};

/// Default number of items per page; the portal's fixed page size.
pub const DEFAULT_PAGE_SIZE: u64 = 50;

/// How an [`ItemsReader`] walks the pages of a list method.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReadStrategy {
    /// One call per page with an advancing `start` offset.
    #[default]
    Direct,
    /// First page fetched directly to learn `total`, the remaining pages
    /// fetched up to 50 at a time inside one `batch` call.
    BatchAssisted,
    /// Keyset pagination on an ascending id field (`>ID` filter,
    /// `start = -1`). Avoids deep offsets on large tables.
    IdCursor {
        /// Name of the id field, e.g. `ID` or `id`
        id_field: String,
    },
}

impl ReadStrategy {
    /// Keyset pagination on `id_field`.
    pub fn id_cursor(id_field: impl Into<String>) -> Self {
        ReadStrategy::IdCursor {
            id_field: id_field.into(),
        }
    }
}

/// One fetched page.
pub(crate) struct Page {
    items: Vec<Value>,
    /// Cursor of the following page, `None` on the last page.
    next: Option<u64>,
    /// Failure discovered after `items`, yielded once they are drained.
    failure: Option<Error>,
}

impl Page {
    fn new(items: Vec<Value>, next: Option<u64>) -> Self {
        Self {
            items,
            next,
            failure: None,
        }
    }
}

/// Type alias for a boxed future used internally.
type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type PageFetcher = Box<dyn Fn(u64) -> BoxFuture<'static, Result<Page>> + Send + Sync>;

fn page_fetcher<F>(fetch: F) -> PageFetcher
where
    F: Fn(u64) -> BoxFuture<'static, Result<Page>> + Send + Sync + 'static,
{
    Box::new(fetch)
}

/// A stream that lazily fetches pages from a list method.
///
/// This stream yields individual items, deserialized into `T` as they are
/// yielded, and holds at most one fetched response at a time. The first
/// page-level failure is yielded as an error and ends the stream. Dropping
/// the stream stops further requests.
///
/// # Example
///
/// ```no_run
/// use futures_util::StreamExt;
/// use bitrix24_rs::{Bitrix24Client, ListQuery};
/// use serde_json::{json, Value};
///
/// # async fn example(client: Bitrix24Client) -> bitrix24_rs::Result<()> {
/// let mut deals = client
///     .items("crm.deal.list")
///     .query(ListQuery::new().filter(json!({"STAGE_ID": "NEW"})).select(["ID", "TITLE"]))
///     .stream::<Value>();
///
/// while let Some(deal) = deals.next().await {
///     println!("{}", deal?);
/// }
/// # Ok(())
/// # }
/// ```
pub struct PaginatedStream<T> {
    /// Function to fetch a page by cursor.
    fetch_page: PageFetcher,
    /// Remaining items of the current page.
    current_items: std::vec::IntoIter<Value>,
    /// Cursor of the page fetched last.
    cursor: u64,
    /// Cursor of the next page to fetch, `None` if exhausted.
    next_cursor: Option<u64>,
    /// Current in-flight fetch future.
    pending_fetch: Option<BoxFuture<'static, Result<Page>>>,
    /// Error to yield once the current items are drained.
    pending_error: Option<Error>,
    pages_fetched: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PaginatedStream<T> {
    pub(crate) fn new(fetch_page: PageFetcher) -> Self {
        Self {
            fetch_page,
            current_items: Vec::new().into_iter(),
            cursor: 0,
            next_cursor: Some(0),
            pending_fetch: None,
            pending_error: None,
            pages_fetched: 0,
            _marker: PhantomData,
        }
    }

    /// A stream that yields `err` and ends.
    pub(crate) fn failed(err: Error) -> Self {
        Self {
            fetch_page: page_fetcher(|_| {
                Box::pin(async { Err(Error::InvalidResponse("stream has ended".to_string())) })
            }),
            current_items: Vec::new().into_iter(),
            cursor: 0,
            next_cursor: None,
            pending_fetch: None,
            pending_error: Some(err),
            pages_fetched: 0,
            _marker: PhantomData,
        }
    }

    /// Cursor of the page fetched last: an offset, or the last id seen
    /// for keyset reads.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Whether more items may be yielded.
    pub fn has_more(&self) -> bool {
        !self.current_items.as_slice().is_empty()
            || self.next_cursor.is_some()
            || self.pending_fetch.is_some()
            || self.pending_error.is_some()
    }

    /// Number of physical responses received so far.
    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }

    /// Items of the current page not yet yielded.
    pub fn buffered_items(&self) -> usize {
        self.current_items.len()
    }

    fn finish_with(&mut self, err: Error) -> Poll<Option<Result<T>>> {
        self.next_cursor = None;
        self.current_items = Vec::new().into_iter();
        Poll::Ready(Some(Err(err)))
    }
}

impl<T> Stream for PaginatedStream<T>
where
    T: DeserializeOwned,
{
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if let Some(item) = this.current_items.next() {
                return Poll::Ready(Some(serde_json::from_value(item).map_err(Error::from)));
            }

            if let Some(err) = this.pending_error.take() {
                return this.finish_with(err);
            }

            if let Some(fut) = this.pending_fetch.as_mut() {
                match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(page)) => {
                        this.pending_fetch = None;
                        this.pages_fetched += 1;
                        this.pending_error = page.failure;
                        this.current_items = page.items.into_iter();

                        match page.next {
                            Some(next) if next <= this.cursor => {
                                this.pending_error = Some(Error::InvalidResponse(format!(
                                    "pagination cursor did not advance past {}",
                                    this.cursor
                                )));
                                this.next_cursor = None;
                            }
                            next => this.next_cursor = next,
                        }
                        continue;
                    }
                    Poll::Ready(Err(e)) => {
                        this.pending_fetch = None;
                        return this.finish_with(e);
                    }
                    Poll::Pending => {
                        return Poll::Pending;
                    }
                }
            }

            if let Some(cursor) = this.next_cursor.take() {
                this.cursor = cursor;
                this.pending_fetch = Some((this.fetch_page)(cursor));
                continue;
            }

            return Poll::Ready(None);
        }
    }
}

/// Builder for reading every item of a list method.
///
/// Created by [`Bitrix24Client::items`](crate::Bitrix24Client::items).
pub struct ItemsReader {
    inner: Arc<ClientInner>,
    method: String,
    query: ListQuery,
    strategy: ReadStrategy,
    page_size: u64,
}

impl ItemsReader {
    pub(crate) fn new(inner: Arc<ClientInner>, method: String) -> Self {
        Self {
            inner,
            method,
            query: ListQuery::default(),
            strategy: ReadStrategy::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Set the whole query.
    pub fn query(mut self, query: ListQuery) -> Self {
        self.query = query;
        self
    }

    /// Set the filter.
    pub fn filter(mut self, filter: Value) -> Self {
        self.query = self.query.filter(filter);
        self
    }

    /// Set the order.
    pub fn order(mut self, order: Value) -> Self {
        self.query = self.query.order(order);
        self
    }

    /// Set the selected fields.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query = self.query.select(fields);
        self
    }

    /// Set the pagination strategy.
    pub fn strategy(mut self, strategy: ReadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the page size the portal uses for this method.
    ///
    /// A page shorter than this ends the read.
    pub fn page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Build the stream, deserializing each item into `T`.
    ///
    /// An invalid method name is yielded as the first item.
    pub fn stream<T: DeserializeOwned>(self) -> PaginatedStream<T> {
        let method = match MethodName::new(self.method) {
            Ok(method) => method,
            Err(err) => return PaginatedStream::failed(err),
        };
        debug!(method = %method, strategy = ?self.strategy, "items read started");

        let source = Arc::new(PageSource {
            inner: self.inner,
            method,
            query: self.query,
            page_size: self.page_size,
        });

        let fetch_page: PageFetcher = match self.strategy {
            ReadStrategy::Direct => page_fetcher(move |start| {
                let source = source.clone();
                Box::pin(async move { source.direct_page(start).await })
            }),
            ReadStrategy::BatchAssisted => {
                let total = Arc::new(OnceLock::new());
                page_fetcher(move |start| {
                    let source = source.clone();
                    let total = total.clone();
                    Box::pin(async move { source.batch_round(start, &total).await })
                })
            }
            ReadStrategy::IdCursor { id_field } => {
                let id_field = Arc::new(id_field);
                page_fetcher(move |last_id| {
                    let source = source.clone();
                    let id_field = id_field.clone();
                    Box::pin(async move { source.keyset_page(&id_field, last_id).await })
                })
            }
        };

        PaginatedStream::new(fetch_page)
    }
}

impl std::fmt::Debug for ItemsReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemsReader")
            .field("method", &self.method)
            .field("query", &self.query)
            .field("strategy", &self.strategy)
            .field("page_size", &self.page_size)
            .finish()
    }
}

/// Everything a page fetch needs, shared by the fetches of one stream.
struct PageSource {
    inner: Arc<ClientInner>,
    method: MethodName,
    query: ListQuery,
    page_size: u64,
}

impl PageSource {
    async fn direct_page(&self, start: u64) -> Result<Page> {
        self.fetch_direct(start).await.map(|(page, _)| page)
    }

    /// Fetch one page with a plain call; also returns the reported total.
    async fn fetch_direct(&self, start: u64) -> Result<(Page, Option<u64>)> {
        let response = self
            .inner
            .call_method(&self.method, &self.query.to_params(start as i64))
            .await?;
        let total = response.total;
        let next = response.next;
        let items = self.query.items_of(response.result)?;

        let next = if (items.len() as u64) < self.page_size {
            None
        } else {
            next.filter(|next| total.map_or(true, |total| *next < total))
        };
        Ok((Page::new(items, next), total))
    }

    async fn batch_round(&self, start: u64, total: &OnceLock<u64>) -> Result<Page> {
        let known_total = match total.get() {
            Some(total) => *total,
            None => {
                let (page, reported) = self.fetch_direct(start).await?;
                if let Some(reported) = reported {
                    let _ = total.set(reported);
                }
                return Ok(page);
            }
        };

        let offsets: Vec<u64> = (start..known_total)
            .step_by(self.page_size as usize)
            .take(MAX_BATCH_SIZE)
            .collect();
        if offsets.is_empty() {
            return Ok(Page::new(Vec::new(), None));
        }

        let commands: Vec<Command> = offsets
            .iter()
            .map(|offset| {
                Command::new(
                    format!("page_{}", offset),
                    self.method.as_str(),
                    self.query.to_params(*offset as i64),
                )
            })
            .collect();
        debug!(method = %self.method, start, pages = commands.len(), "fetching pages in batch");

        let response = self.inner.dispatch_chunk(&commands, true).await?;
        let mut payload = BatchPayload::parse(response.result)?;

        let mut items = Vec::new();
        let mut next = None;
        for (offset, command) in offsets.iter().zip(&commands) {
            let page = match payload.take(&command.key) {
                Some(Ok(page)) => page,
                Some(Err(err)) => {
                    return Ok(Page {
                        items,
                        next: None,
                        failure: Some(Error::Command {
                            key: command.key.to_string(),
                            source: Arc::new(err),
                        }),
                    })
                }
                None => {
                    return Ok(Page {
                        items,
                        next: None,
                        failure: Some(Error::InvalidResponse(format!(
                            "batch response has no result for {}",
                            command.key
                        ))),
                    })
                }
            };

            let page_items = match self.query.items_of(page.result) {
                Ok(page_items) => page_items,
                Err(err) => {
                    return Ok(Page {
                        items,
                        next: None,
                        failure: Some(err),
                    })
                }
            };
            let short = (page_items.len() as u64) < self.page_size;
            items.extend(page_items);
            if short {
                return Ok(Page::new(items, None));
            }
            next = Some(offset + self.page_size);
        }

        Ok(Page::new(items, next.filter(|next| *next < known_total)))
    }

    async fn keyset_page(&self, id_field: &str, last_id: u64) -> Result<Page> {
        let mut query = self.query.clone();
        query
            .filter
            .insert(format!(">{}", id_field), Value::from(last_id));
        query.order.clear();
        query
            .order
            .insert(id_field.to_string(), Value::String("ASC".to_string()));

        let response = self.inner.call_method(&self.method, &query.to_params(-1)).await?;
        let items = query.items_of(response.result)?;

        if (items.len() as u64) < self.page_size {
            return Ok(Page::new(items, None));
        }
        let next = match items.last().map(|item| item_id(item, id_field)) {
            Some(Some(id)) => Some(id),
            _ => {
                return Ok(Page {
                    items,
                    next: None,
                    failure: Some(Error::InvalidResponse(format!(
                        "list item has no numeric {} field",
                        id_field
                    ))),
                })
            }
        };
        Ok(Page::new(items, next))
    }
}

/// Read a numeric id that the portal may encode as a string.
fn item_id(item: &Value, id_field: &str) -> Option<u64> {
    match item.get(id_field)? {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}
