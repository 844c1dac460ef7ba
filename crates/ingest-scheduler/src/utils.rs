//! Small helpers shared across the crate.

/// Align a map size on the OS page size, as LMDB requires.
pub fn clamp_to_page_size(size: usize) -> usize {
    size / page_size::get() * page_size::get()
}
