//! # Search Pagination
//!
//! Sliding-window pagination over vendor search endpoints that refuse offsets
//! beyond a fixed ceiling (HubSpot rejects `after` values past 10,000).
//!
//! Results are requested in ascending order of a timestamp property inside a
//! half-open window `[start, end)`. Once the offset cursor gets within one page
//! of the ceiling the window start moves just past the last row seen and the
//! cursor resets, so arbitrarily large result sets can be walked with bounded
//! offsets. The window end never moves during a run.
//!
//! Rows on either side of a slide can come back twice, so every page is
//! filtered against the ids of the page yielded just before it. The filter
//! only remembers one page; ids duplicated further back are not caught.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::Stream;
use metrics::counter;
use tracing::{debug, instrument};

/// Half-open time range `[start, end)` over `sort_field`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub sort_field: String,
}

impl SearchWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, sort_field: impl Into<String>) -> Self {
        debug_assert!(start <= end, "search window start must not exceed end");
        Self {
            start,
            end,
            sort_field: sort_field.into(),
        }
    }

    /// Moves the start one millisecond past `last_sort_value`.
    fn slide_past(&mut self, last_sort_value: DateTime<Utc>) {
        self.start = last_sort_value + Duration::milliseconds(1);
    }
}

/// Offset of the next page within the current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageCursor(u64);

impl PageCursor {
    pub fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub fn offset(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Minimal shape every search result row exposes.
pub trait SearchRow {
    fn row_id(&self) -> &str;
    fn sort_value(&self) -> DateTime<Utc>;
}

/// One page as returned by a [`SearchSource`].
#[derive(Debug, Clone)]
pub struct SearchPage<R> {
    pub results: Vec<R>,
    pub next_cursor: Option<PageCursor>,
}

/// Vendor search endpoint.
#[async_trait]
pub trait SearchSource: Send + Sync {
    type Row: SearchRow + Send;
    type Error: Send;

    async fn fetch_page(
        &self,
        window: &SearchWindow,
        cursor: Option<&PageCursor>,
    ) -> Result<SearchPage<Self::Row>, Self::Error>;
}

#[async_trait]
impl<T> SearchSource for std::sync::Arc<T>
where
    T: SearchSource + ?Sized,
{
    type Row = T::Row;
    type Error = T::Error;

    async fn fetch_page(
        &self,
        window: &SearchWindow,
        cursor: Option<&PageCursor>,
    ) -> Result<SearchPage<Self::Row>, Self::Error> {
        (**self).fetch_page(window, cursor).await
    }
}

/// Offset ceiling and page size of the vendor endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationLimits {
    pub max_offset: u64,
    pub page_limit: u64,
}

impl PaginationLimits {
    /// Cursors at or beyond this offset trigger a window slide.
    pub fn slide_threshold(&self) -> u64 {
        self.max_offset.saturating_sub(self.page_limit)
    }
}

impl From<&crate::config::SearchConfig> for PaginationLimits {
    fn from(config: &crate::config::SearchConfig) -> Self {
        Self {
            max_offset: config.max_offset,
            page_limit: config.page_limit,
        }
    }
}

/// Counters for a single paginator run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PaginationStats {
    pub pages_fetched: u64,
    pub pages_yielded: u64,
    pub rows_yielded: u64,
    pub window_slides: u64,
    pub duplicates_filtered: u64,
}

/// Walks every row of a window, page by page.
pub struct SearchPaginator<S: SearchSource> {
    source: S,
    limits: PaginationLimits,
    window: SearchWindow,
    cursor: Option<PageCursor>,
    boundary_ids: HashSet<String>,
    exhausted: bool,
    stats: PaginationStats,
}

impl<S: SearchSource> SearchPaginator<S> {
    pub fn new(source: S, window: SearchWindow, limits: PaginationLimits) -> Self {
        Self {
            source,
            limits,
            window,
            cursor: None,
            boundary_ids: HashSet::new(),
            exhausted: false,
            stats: PaginationStats::default(),
        }
    }

    /// Current window; `start` moves forward on every slide.
    pub fn window(&self) -> &SearchWindow {
        &self.window
    }

    pub fn stats(&self) -> PaginationStats {
        self.stats
    }

    /// Fetches the next non-empty page of unseen rows.
    ///
    /// Returns `Ok(None)` once the source is exhausted. Errors from the source
    /// are returned as-is; the paginator stays at the same window and cursor, so
    /// calling again repeats the failed request.
    #[instrument(skip_all, fields(sort_field = %self.window.sort_field))]
    pub async fn next_page(&mut self) -> Result<Option<Vec<S::Row>>, S::Error> {
        loop {
            if self.exhausted {
                return Ok(None);
            }

            let page = self
                .source
                .fetch_page(&self.window, self.cursor.as_ref())
                .await?;
            self.stats.pages_fetched += 1;
            counter!("search_pages_fetched_total").increment(1);

            let Some(raw_last_sort) = page.results.last().map(SearchRow::sort_value) else {
                debug!(
                    window_start = %self.window.start,
                    cursor = ?self.cursor,
                    "Search returned an empty page, stopping"
                );
                self.exhausted = true;
                return Ok(None);
            };

            let fetched = page.results.len();
            let rows: Vec<S::Row> = page
                .results
                .into_iter()
                .filter(|row| !self.boundary_ids.contains(row.row_id()))
                .collect();

            let filtered = (fetched - rows.len()) as u64;
            if filtered > 0 {
                self.stats.duplicates_filtered += filtered;
                counter!("search_duplicates_filtered_total").increment(filtered);
                debug!(filtered, "Dropped rows already yielded on the previous page");
            }

            let Some(last_sort) = rows.last().map(SearchRow::sort_value) else {
                // Every row was a repeat: move past the page without yielding it.
                self.boundary_ids.clear();
                self.advance(page.next_cursor, raw_last_sort);
                continue;
            };

            self.boundary_ids = rows.iter().map(|row| row.row_id().to_string()).collect();
            self.advance(page.next_cursor, last_sort);

            self.stats.pages_yielded += 1;
            self.stats.rows_yielded += rows.len() as u64;
            return Ok(Some(rows));
        }
    }

    fn advance(&mut self, next_cursor: Option<PageCursor>, last_sort: DateTime<Utc>) {
        match next_cursor {
            None => {
                self.exhausted = true;
            }
            Some(cursor) if cursor.offset() >= self.limits.slide_threshold() => {
                self.window.slide_past(last_sort);
                self.cursor = None;
                self.stats.window_slides += 1;
                counter!("search_window_slides_total").increment(1);
                debug!(
                    cursor = cursor.offset(),
                    new_start = %self.window.start,
                    window_end = %self.window.end,
                    "Offset ceiling reached, sliding search window"
                );
            }
            Some(cursor) => {
                self.cursor = Some(cursor);
            }
        }
    }

    /// Lazy stream of pages. Dropping the stream stops the run.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<S::Row>, S::Error>> {
        futures::stream::try_unfold(self, |mut paginator| async move {
            let rows = paginator.next_page().await?;
            Ok::<_, S::Error>(rows.map(|rows| (rows, paginator)))
        })
    }
}
