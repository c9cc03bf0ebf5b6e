//! Pagination drivers
//!
//! A driver decides which page to request next. The collector engine asks it for
//! requests while it has free worker slots and reports every completed page back
//! through [`Pager::observe`]. Two protocols are supported:
//!
//! - **Offset** (`?page=N&size=M`): page numbers are handed out ahead of time, so
//!   several pages can be in flight at once. The first page shorter than the page
//!   size marks the end.
//! - **Cursor** (GraphQL `pageInfo { endCursor hasNextPage }`): the next request is
//!   only known once the previous response arrived, so at most one page is in flight.

use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// 1-based page number
    pub page: u64,
    /// Requested page size
    pub size: usize,
    /// Items to skip before this page (offset APIs)
    pub skip: u64,
    /// Continuation token (cursor APIs); `None` for the first page
    pub cursor: Option<String>,
}

/// What a completed page tells the driver about the rest of the result set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageInfo {
    /// Items the source returned on this page, before any filtering
    pub item_count: usize,
    /// Continuation token for the next page (cursor APIs)
    pub next_cursor: Option<String>,
    /// Whether the source reports further pages (cursor APIs)
    pub has_next_page: bool,
}

impl PageInfo {
    pub fn offset(item_count: usize) -> Self {
        Self {
            item_count,
            next_cursor: None,
            has_next_page: false,
        }
    }

    pub fn cursor(item_count: usize, next_cursor: Option<String>, has_next_page: bool) -> Self {
        Self {
            item_count,
            next_cursor,
            has_next_page,
        }
    }
}

/// Answer to "what should be fetched next?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    Request(PageRequest),
    /// Nothing can be scheduled until an in-flight page completes
    Wait,
    /// The result set is exhausted
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaginationMode {
    Offset,
    Cursor,
}

#[derive(Debug, Clone)]
pub struct OffsetPager {
    size: usize,
    next_page: u64,
    /// First page seen shorter than `size`
    last_page: Option<u64>,
    max_pages: usize,
}

impl OffsetPager {
    pub fn new(size: usize, max_pages: usize) -> Self {
        Self {
            size,
            next_page: 1,
            last_page: None,
            max_pages,
        }
    }

    pub fn next_page(&mut self) -> Advance {
        if let Some(last) = self.last_page {
            if self.next_page > last {
                return Advance::Exhausted;
            }
        }
        if self.max_pages > 0 && self.next_page > self.max_pages as u64 {
            return Advance::Exhausted;
        }

        let page = self.next_page;
        self.next_page += 1;
        Advance::Request(PageRequest {
            page,
            size: self.size,
            skip: (page - 1) * self.size as u64,
            cursor: None,
        })
    }

    /// A page shorter than the page size is the last one.
    fn is_last(&self, info: &PageInfo) -> bool {
        info.item_count < self.size
    }

    pub fn observe(&mut self, request: &PageRequest, info: &PageInfo) -> Result<()> {
        if self.is_last(info) {
            let last = self.last_page.map_or(request.page, |l| l.min(request.page));
            self.last_page = Some(last);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CursorState {
    Start,
    InFlight,
    Ready(String),
    Done,
}

#[derive(Debug, Clone)]
pub struct CursorPager {
    size: usize,
    state: CursorState,
    pages_issued: u64,
    seen: HashSet<String>,
    max_pages: usize,
}

impl CursorPager {
    pub fn new(size: usize, max_pages: usize) -> Self {
        Self {
            size,
            state: CursorState::Start,
            pages_issued: 0,
            seen: HashSet::new(),
            max_pages,
        }
    }

    pub fn next_page(&mut self) -> Advance {
        let cursor = match &self.state {
            CursorState::Start => None,
            CursorState::Ready(cursor) => Some(cursor.clone()),
            CursorState::InFlight => return Advance::Wait,
            CursorState::Done => return Advance::Exhausted,
        };
        if self.max_pages > 0 && self.pages_issued >= self.max_pages as u64 {
            self.state = CursorState::Done;
            return Advance::Exhausted;
        }

        self.pages_issued += 1;
        self.state = CursorState::InFlight;
        Advance::Request(PageRequest {
            page: self.pages_issued,
            size: self.size,
            skip: (self.pages_issued - 1) * self.size as u64,
            cursor,
        })
    }

    fn is_last(&self, info: &PageInfo) -> bool {
        !info.has_next_page
    }

    /// Record the page info of the page fetched with `request`.
    ///
    /// Fails with a protocol error when the source claims more pages but hands
    /// back no cursor, or a cursor that was already used in this run.
    pub fn observe(&mut self, request: &PageRequest, info: &PageInfo) -> Result<()> {
        if self.is_last(info) {
            self.state = CursorState::Done;
            return Ok(());
        }

        let next = match info.next_cursor.as_deref() {
            Some(cursor) if !cursor.is_empty() => cursor.to_string(),
            _ => {
                self.state = CursorState::Done;
                return Err(IngestError::Protocol(format!(
                    "page {} reports more pages but carries no cursor",
                    request.page
                )));
            }
        };

        let regressed = request.cursor.as_deref() == Some(next.as_str());
        if regressed || !self.seen.insert(next.clone()) {
            self.state = CursorState::Done;
            return Err(IngestError::Protocol(format!(
                "cursor {:?} returned by page {} did not advance",
                next, request.page
            )));
        }

        self.state = CursorState::Ready(next);
        Ok(())
    }
}

/// Result of parsing one page.
///
/// `EarlyFinish` is a clean stop: its units are staged and the lane schedules no
/// further pages. `Fatal` aborts the whole run.
#[derive(Debug)]
pub enum PageOutcome<T = Value> {
    Continue(Vec<T>),
    EarlyFinish(Vec<T>),
    Fatal(IngestError),
}

impl<T> PageOutcome<T> {
    pub fn units(&self) -> &[T] {
        match self {
            PageOutcome::Continue(units) | PageOutcome::EarlyFinish(units) => units,
            PageOutcome::Fatal(_) => &[],
        }
    }
}

/// A parsed page together with what it says about pagination.
#[derive(Debug)]
pub struct ParsedPage {
    pub outcome: PageOutcome,
    pub page_info: PageInfo,
}

impl ParsedPage {
    /// Offset pages end when fewer units than the page size come back.
    pub fn offset(outcome: PageOutcome) -> Self {
        let item_count = outcome.units().len();
        Self {
            outcome,
            page_info: PageInfo::offset(item_count),
        }
    }

    pub fn cursor(outcome: PageOutcome, next_cursor: Option<String>, has_next_page: bool) -> Self {
        let item_count = outcome.units().len();
        Self {
            outcome,
            page_info: PageInfo::cursor(item_count, next_cursor, has_next_page),
        }
    }

    pub fn fatal(err: IngestError) -> Self {
        Self {
            outcome: PageOutcome::Fatal(err),
            page_info: PageInfo::default(),
        }
    }
}

/// Pagination driver, one per input lane of a run.
#[derive(Debug, Clone)]
pub enum Pager {
    Offset(OffsetPager),
    Cursor(CursorPager),
}

impl Pager {
    pub fn new(mode: PaginationMode, size: usize, max_pages: usize) -> Self {
        match mode {
            PaginationMode::Offset => Pager::Offset(OffsetPager::new(size, max_pages)),
            PaginationMode::Cursor => Pager::Cursor(CursorPager::new(size, max_pages)),
        }
    }

    pub fn next_page(&mut self) -> Advance {
        match self {
            Pager::Offset(p) => p.next_page(),
            Pager::Cursor(p) => p.next_page(),
        }
    }

    pub fn observe(&mut self, request: &PageRequest, info: &PageInfo) -> Result<()> {
        match self {
            Pager::Offset(p) => p.observe(request, info),
            Pager::Cursor(p) => p.observe(request, info),
        }
    }
}
