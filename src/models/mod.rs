pub mod courier;
pub mod offer_log;
pub mod order;
pub mod pool;
pub mod watcher;

use serde::Serialize;

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 200;

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

impl<T> Page<T> {
    /// Slices an already filtered and ordered collection.
    pub fn from_vec(all: Vec<T>, limit: u32, offset: u32) -> Self {
        let total = all.len() as u64;
        let items = all
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Self {
            items,
            total,
            limit,
            offset,
        }
    }
}

pub fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}
