use crate::error::{RegistryError, Result};
use serde::Serialize;

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 100;

/// Offset pagination over id-ordered listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl Page {
    pub fn new(limit: Option<usize>, offset: Option<usize>) -> Result<Self> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(RegistryError::validation(
                "limit",
                format!("must be between 1 and {}", MAX_PAGE_LIMIT),
            ));
        }

        Ok(Self {
            limit,
            offset: offset.unwrap_or(0),
        })
    }

    pub fn apply<T, I>(&self, items: I) -> Paginated<T>
    where
        I: IntoIterator<Item = T>,
    {
        Paginated {
            items: items.into_iter().skip(self.offset).take(self.limit).collect(),
            limit: self.limit,
            offset: self.offset,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Paginated<T> {
    pub items: Vec<T>,
    pub limit: usize,
    pub offset: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_bounds() {
        assert_eq!(Page::new(None, None).unwrap(), Page::default());
        assert!(Page::new(Some(0), None).is_err());
        assert!(Page::new(Some(101), None).is_err());
        assert_eq!(Page::new(Some(100), Some(7)).unwrap().offset, 7);
    }

    #[test]
    fn test_apply_skips_and_takes() {
        let page = Page::new(Some(2), Some(1)).unwrap();
        let result = page.apply(vec![1, 2, 3, 4]);
        assert_eq!(result.items, vec![2, 3]);
        assert_eq!(result.limit, 2);
        assert_eq!(result.offset, 1);
    }
}
