//! Request planning for paged history scans.

/// One `hmyv2_getTransactionsHistory` page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub index: u64,
    /// Requested page size, including the overlap.
    pub size: u64,
}

/// Pages needed to cover `count` transactions plus 1% headroom for
/// transactions landing mid-scan. Each page asks for `page_size + overlap`
/// entries so consecutive pages overlap.
pub fn plan_pages(count: u64, page_size: u64, overlap: u64) -> Vec<PageRequest> {
    if page_size == 0 {
        return Vec::new();
    }
    let target = count.saturating_mul(101) / 100;
    (0..target.div_ceil(page_size))
        .map(|index| PageRequest {
            index,
            size: page_size + overlap,
        })
        .collect()
}
