//! Global allocator selection: jemalloc on unix systems when the `jemalloc` feature is
//! enabled, the system allocator otherwise.

#[cfg(all(feature = "jemalloc", unix))]
type AllocatorInner = tikv_jemallocator::Jemalloc;
#[cfg(not(all(feature = "jemalloc", unix)))]
type AllocatorInner = std::alloc::System;

/// The allocator of the `keel` binary.
pub(crate) type Allocator = AllocatorInner;

/// Creates a new [`Allocator`].
pub(crate) const fn new_allocator() -> Allocator {
    AllocatorInner {}
}
