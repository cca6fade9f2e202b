//! `DemandFaulter` — on-demand population of the device page.
//!
//! Resolves a fault at any offset inside a mapping to the single backing
//! page and takes a reference on it for the faulting mapping. This path is
//! NOT wired into `MappingSession::request`, which maps the page eagerly;
//! it is kept for hosts that install mappings lazily.

use std::sync::Arc;

use khello_core::error::{KhelloError, Result};
use khello_core::ktrace;

use crate::mappable_page::MappablePage;

pub struct DemandFaulter {
    page: Arc<MappablePage>,
}

/// A resolved fault. Holds one reference on the page until dropped.
#[derive(Debug)]
pub struct FaultedPage {
    page: Arc<MappablePage>,
    offset: usize,
}

impl FaultedPage {
    /// Page index within the mapping. There is only one page.
    pub fn pgoff(&self) -> usize {
        0
    }

    /// Device-side address that satisfies the faulting access.
    pub fn address(&self) -> usize {
        self.page.base() + self.offset
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn page(&self) -> &Arc<MappablePage> {
        &self.page
    }
}

impl DemandFaulter {
    pub fn new(page: &Arc<MappablePage>) -> Self {
        Self { page: Arc::clone(page) }
    }

    /// Resolve a fault at `offset` bytes into the mapping.
    pub fn fault(&self, offset: usize) -> Result<FaultedPage> {
        let limit = self.page.size();
        if offset >= limit {
            return Err(KhelloError::OutOfRange { offset, len: 1, limit });
        }
        let page = Arc::clone(&self.page);
        ktrace!(
            "{}: fault at offset {:#x}, page refs {}",
            page.name(),
            offset,
            Arc::strong_count(&page)
        );
        Ok(FaultedPage { page, offset })
    }
}
