/// Recoverable allocation failures reported to callers.
///
/// Invariant violations (double free, foreign address, corrupt links) are not
/// represented here: they panic with the allocator and address involved.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid allocation size {size:#x}")]
    InvalidSize { size: usize },
    #[error("invalid alignment {align:#x}")]
    InvalidAlignment { align: usize },
    #[error("allocator metadata arena is full")]
    ArenaFull,
}

/// Failure of the boot-time bump allocator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EarlyAllocError {
    #[error("early window exhausted: requested {requested:#x} bytes, {remaining:#x} left")]
    Exhausted { requested: usize, remaining: usize },
}

/// Failure while assembling the allocation stack at boot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootstrapError {
    #[error("memory map contains no usable frames")]
    NoUsableMemory,
    #[error("failed to seed the kernel heap: {0}")]
    Heap(#[from] AllocError),
}

/// Rejected change to a [`VmSpace`](crate::layout::VmSpace).
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("range `{name}` is empty")]
    Empty { name: &'static str },
    #[error("range `{name}` overlaps `{other}`")]
    Overlap {
        name: &'static str,
        other: &'static str,
    },
    #[error("address-space layout is full")]
    Full,
}
