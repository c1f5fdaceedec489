//! Page-number pagination over query results.
//!
//! [`Collection::find_page`](crate::collection::Collection::find_page) runs a
//! query and hands the full, insertion-ordered result to
//! [`PaginationParams::paginate`], which cuts out one page and records how to
//! reach its neighbours.

use serde::{Deserialize, Serialize};

const DEFAULT_PER_PAGE: usize = 10;

/// One page of a larger result set.
///
/// # Example
///
/// ```ignore
/// use emberdoc::page::PaginationParams;
///
/// let page = PaginationParams::new(2, 10).paginate((1..=25).collect::<Vec<_>>());
///
/// assert_eq!(page.items, (11..=20).collect::<Vec<_>>());
/// assert_eq!(page.count, 25);
/// assert_eq!(page.next_page, Some(3));
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Number of items across all pages.
    pub count: usize,
    pub next_page: Option<usize>,
    pub previous_page: Option<usize>,
}

impl<T> Page<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Transforms the items while keeping the navigation data.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            count: self.count,
            next_page: self.next_page,
            previous_page: self.previous_page,
        }
    }
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            count: 0,
            next_page: None,
            previous_page: None,
        }
    }
}

/// Which page to return and how large pages are. Pages are 1-indexed; a page
/// of 0 is read as 1.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct PaginationParams {
    pub page: usize,
    pub per_page: usize,
}

impl PaginationParams {
    pub fn new(page: usize, per_page: usize) -> Self {
        Self { page, per_page }
    }

    pub fn builder() -> PaginationParamsBuilder {
        PaginationParamsBuilder::default()
    }

    fn page_number(&self) -> usize {
        self.page.max(1)
    }

    /// Number of items skipped before this page.
    pub fn offset(&self) -> usize {
        (self.page_number() - 1).saturating_mul(self.per_page)
    }

    /// Cuts this page out of `items`.
    ///
    /// A page past the end comes back empty but still reports the total
    /// count and a way back.
    pub fn paginate<T>(&self, items: Vec<T>) -> Page<T> {
        let count = items.len();
        let page = self.page_number();
        let offset = self.offset();
        let end = offset.saturating_add(self.per_page).min(count);

        let items: Vec<T> = items.into_iter().skip(offset).take(self.per_page).collect();

        Page {
            items,
            count,
            next_page: (end < count && self.per_page > 0).then_some(page + 1),
            previous_page: (page > 1).then(|| page - 1),
        }
    }
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

#[derive(Debug, Default)]
pub struct PaginationParamsBuilder {
    page: Option<usize>,
    per_page: Option<usize>,
}

impl PaginationParamsBuilder {
    pub fn with_page(mut self, page: usize) -> Self {
        self.page = Some(page);
        self
    }

    pub fn with_per_page(mut self, per_page: usize) -> Self {
        self.per_page = Some(per_page);
        self
    }

    pub fn build(self) -> PaginationParams {
        PaginationParams {
            page: self.page.unwrap_or(1),
            per_page: self.per_page.unwrap_or(DEFAULT_PER_PAGE),
        }
    }
}
