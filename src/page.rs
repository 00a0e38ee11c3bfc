//! Offset pagination shared by catalog listings and document reads.

use serde::{Deserialize, Serialize};

use crate::config::PaginationConfig;

/// A 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u64,
    pub page_size: u64,
}

impl PageRequest {
    pub fn new(page: u64, page_size: u64) -> Self {
        Self { page, page_size }
    }

    /// Clamps the request into `1..` pages of `1..=max_page_size` items.
    pub fn normalized(self, config: &PaginationConfig) -> Self {
        let page_size = if self.page_size == 0 {
            config.default_page_size
        } else {
            self.page_size
        };
        Self {
            page: self.page.max(1),
            page_size: page_size.clamp(1, config.max_page_size.max(1)),
        }
    }

    /// `(page - 1) * page_size`
    pub fn skip(&self) -> u64 {
        self.page.saturating_sub(1).saturating_mul(self.page_size)
    }
}

/// One page of results plus the total number of matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
    pub items: Vec<T>,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            total: self.total,
            page: self.page,
            page_size: self.page_size,
            items: self.items.into_iter().map(f).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip() {
        assert_eq!(PageRequest::new(1, 10).skip(), 0);
        assert_eq!(PageRequest::new(3, 25).skip(), 50);
    }

    #[test]
    fn test_normalized() {
        let config = PaginationConfig {
            default_page_size: 10,
            max_page_size: 100,
        };
        assert_eq!(
            PageRequest::new(0, 0).normalized(&config),
            PageRequest::new(1, 10)
        );
        assert_eq!(
            PageRequest::new(2, 5_000).normalized(&config),
            PageRequest::new(2, 100)
        );
    }
}
