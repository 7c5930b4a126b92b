use serde::Serialize;

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 200;

/// A clamped page request: `page` starts at 1, `page_size` is 1..=200.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Page {
    pub fn new(page: Option<u32>, page_size: Option<u32>) -> Self {
        let page = page.filter(|p| *p > 0).unwrap_or(1);
        let page_size = match page_size {
            None | Some(0) => DEFAULT_PAGE_SIZE,
            Some(n) => n.min(MAX_PAGE_SIZE),
        };
        Self { page, page_size }
    }

    pub(crate) fn limit(self) -> i64 {
        i64::from(self.page_size)
    }

    pub(crate) fn offset(self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.page_size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Paged<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case(None, None, 1, 20)]
    #[case(Some(0), Some(0), 1, 20)]
    #[case(Some(3), Some(50), 3, 50)]
    #[case(Some(2), Some(1000), 2, 200)]
    fn clamps(
        #[case] page: Option<u32>,
        #[case] size: Option<u32>,
        #[case] want_page: u32,
        #[case] want_size: u32,
    ) {
        let p = Page::new(page, size);
        assert_eq!((p.page, p.page_size), (want_page, want_size));
    }

    #[test]
    fn offset_skips_previous_pages() {
        assert_eq!(Page::new(Some(3), Some(25)).offset(), 50);
    }
}
