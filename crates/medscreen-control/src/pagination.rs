use serde::{Deserialize, Serialize};

pub const MAX_LIMIT: u64 = 100;

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PageParams {
    pub page: Option<u64>,
    pub limit: Option<u64>,
}

impl PageParams {
    /// Returns `(page, limit)`; page starts at 1. An out-of-range limit falls
    /// back to `default_limit`.
    pub fn resolve(&self, default_limit: u64) -> (u64, u64) {
        let page = self.page.filter(|p| *p >= 1).unwrap_or(1);
        let limit = self
            .limit
            .filter(|l| (1..=MAX_LIMIT).contains(l))
            .unwrap_or(default_limit);
        (page, limit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageMeta {
    pub page: u64,
    pub limit: u64,
    pub total: u64,
    pub total_pages: u64,
}

impl PageMeta {
    pub fn new(page: u64, limit: u64, total: u64) -> Self {
        Self {
            page,
            limit,
            total,
            total_pages: total.div_ceil(limit.max(1)),
        }
    }

    pub fn offset(page: u64, limit: u64) -> u64 {
        page.saturating_sub(1).saturating_mul(limit)
    }
}

#[derive(Debug, Serialize)]
pub struct Paged<T> {
    pub data: Vec<T>,
    pub meta: PageMeta,
}
