//! Page-number pagination shared by the widget and submission listings.

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Default number of items per page.
pub const DEFAULT_PER_PAGE: usize = 20;

/// Maximum number of items per page.
pub const MAX_PER_PAGE: usize = 100;

/// A 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: usize,
    pub per_page: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

impl Page {
    /// Build a page request, clamping `page` to at least 1 and `per_page`
    /// into `1..=MAX_PER_PAGE`.
    pub fn new(page: usize, per_page: usize) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, MAX_PER_PAGE),
        }
    }

    /// Build a page request from optional, possibly negative user input.
    pub fn from_params(page: Option<i64>, per_page: Option<i64>) -> Self {
        let page = page.unwrap_or(1).max(1) as usize;
        let per_page = per_page.unwrap_or(DEFAULT_PER_PAGE as i64).max(1) as usize;
        Self::new(page, per_page)
    }

    /// Index of the first item on this page.
    pub fn offset(&self) -> usize {
        (self.page - 1).saturating_mul(self.per_page)
    }

    /// The `[start, end)` slice bounds of this page within `total` items.
    ///
    /// A page past the end yields an empty range.
    pub fn bounds(&self, total: usize) -> std::ops::Range<usize> {
        let start = self.offset().min(total);
        let end = start.saturating_add(self.per_page).min(total);
        start..end
    }

    /// Copy out this page's items.
    pub fn slice<T: Clone>(&self, items: &[T]) -> Vec<T> {
        items[self.bounds(items.len())].to_vec()
    }

    /// Inclusive `(start, stop)` rank indices for a sorted-set range read.
    ///
    /// `None` when the page starts beyond any rank the store can address;
    /// such a page is always empty.
    pub fn rank_range(&self) -> Option<(i64, i64)> {
        let start = i64::try_from(self.offset()).ok()?;
        let len = i64::try_from(self.per_page).ok()?;
        let stop = start.checked_add(len - 1)?;
        Some((start, stop))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_inputs() {
        assert_eq!(Page::new(0, 0), Page { page: 1, per_page: 1 });
        assert_eq!(Page::new(3, 10_000).per_page, MAX_PER_PAGE);
        assert_eq!(Page::from_params(Some(-4), None), Page::default());
    }

    #[test]
    fn bounds_for_middle_page() {
        let p = Page::new(2, 3);
        assert_eq!(p.bounds(10), 3..6);
        assert_eq!(p.rank_range(), Some((3, 5)));
    }

    #[test]
    fn huge_page_has_no_rank_range() {
        let p = Page::new(usize::MAX, 10);
        assert_eq!(p.rank_range(), None);
        assert!(p.bounds(10).is_empty());

        let p = Page::from_params(Some(i64::MAX), Some(10));
        assert_eq!(p.rank_range(), None);
        assert!(p.slice(&[1, 2, 3]).is_empty());
    }

    #[test]
    fn bounds_for_partial_last_page() {
        assert_eq!(Page::new(4, 3).bounds(10), 9..10);
    }

    #[test]
    fn page_past_end_is_empty() {
        let p = Page::new(5, 3);
        assert!(p.bounds(10).is_empty());
        assert!(p.slice(&[1, 2, 3]).is_empty());
    }

    #[test]
    fn slice_copies_page_items() {
        let items: Vec<u32> = (1..=7).collect();
        assert_eq!(Page::new(2, 3).slice(&items), vec![4, 5, 6]);
    }
}
