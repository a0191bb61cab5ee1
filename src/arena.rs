use crate::{
    error::{Capacity, OrchestrationError, Result},
    region::{BufferHandle, Origin},
    types::{Address, HashMap},
    utils::align_up,
};
use core::ops::Range;
use tracing::{debug, trace};

/// Alignment of every arena allocation, in bytes.
pub const ARENA_ALIGNMENT: u64 = 64;

/// Backing device memory handed to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRegion {
    /// First address of the heap. Must be non-zero.
    pub base: Address,
    /// Usable bytes starting at `base`.
    pub size: u64,
}

/// One open scope.
#[derive(Debug)]
pub struct ScopeFrame {
    /// Nesting depth, 1 for the outermost scope.
    pub depth: usize,
    /// Arena offset when the scope was opened.
    pub mark: u64,
    /// Buffers allocated while this was the innermost scope.
    pub buffers: Vec<BufferHandle>,
}

/// What a scope close gave back.
#[derive(Debug)]
pub struct ReclaimedScope {
    /// Depth of the closed scope.
    pub depth: usize,
    /// Absolute address range returned to the arena.
    pub range: Range<Address>,
    /// Buffers that are no longer live.
    pub buffers: Vec<BufferHandle>,
}

/// Bump allocator with a LIFO stack of scope marks.
///
/// Closing a scope rewinds the offset to the scope's mark, reclaiming every
/// allocation made since in O(1) (plus bookkeeping per buffer). Each
/// allocation receives a version from an arena-wide counter, so a reused
/// address never carries the version of a previous occupant.
#[derive(Debug)]
pub struct ScopedArena {
    heap: HeapRegion,
    offset: u64,
    next_version: u32,
    max_depth: usize,
    peak: u64,
    scopes: Vec<ScopeFrame>,
    live: HashMap<Address, u32>,
}

/// Arena position to roll a failed submission back to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ArenaCheckpoint {
    offset: u64,
    buffers: usize,
}

impl ScopedArena {
    /// Arena over `heap` allowing at most `max_depth` nested scopes.
    #[must_use]
    pub fn new(heap: HeapRegion, max_depth: usize) -> Self {
        assert_ne!(heap.base, 0, "ScopedArena::new: heap base must be non-null");
        Self {
            heap,
            offset: 0,
            next_version: 1,
            max_depth,
            peak: 0,
            scopes: Vec::new(),
            live: HashMap::default(),
        }
    }

    /// Number of open scopes.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Bytes currently allocated.
    #[must_use]
    pub const fn used(&self) -> u64 {
        self.offset
    }

    /// Highest offset ever reached.
    #[must_use]
    pub const fn peak(&self) -> u64 {
        self.peak
    }

    pub(crate) fn checkpoint(&self) -> ArenaCheckpoint {
        ArenaCheckpoint {
            offset: self.offset,
            buffers: self.scopes.last().map_or(0, |frame| frame.buffers.len()),
        }
    }

    /// Undo every allocation made in the innermost scope since `checkpoint`.
    /// Versions handed out in between are not reused.
    pub(crate) fn rollback(&mut self, checkpoint: ArenaCheckpoint) {
        if let Some(frame) = self.scopes.last_mut() {
            for buffer in frame.buffers.drain(checkpoint.buffers..) {
                if let Some(addr) = buffer.addr() {
                    self.live.remove(&addr);
                }
            }
        }
        self.offset = checkpoint.offset;
    }

    /// Open a nested scope at the current offset.
    ///
    /// # Errors
    /// `CapacityExceeded(ScopeDepth)` when already at the maximum depth.
    pub fn open_scope(&mut self) -> Result<usize> {
        let depth = self.scopes.len();
        if depth >= self.max_depth {
            return Err(OrchestrationError::CapacityExceeded {
                capacity: Capacity::ScopeDepth,
                requested: depth as u64 + 1,
                available: self.max_depth as u64,
            });
        }
        self.scopes.push(ScopeFrame {
            depth: depth + 1,
            mark: self.offset,
            buffers: Vec::new(),
        });
        debug!(depth = depth + 1, mark = self.offset, "scope opened");
        Ok(depth + 1)
    }

    /// Allocate `size` bytes in the innermost scope.
    ///
    /// # Errors
    /// - `ScopeImbalance` when no scope is open.
    /// - `CapacityExceeded(Arena)` when the heap has no room left.
    pub fn allocate(&mut self, size: u64) -> Result<BufferHandle> {
        let Some(frame) = self.scopes.last_mut() else {
            return Err(OrchestrationError::ScopeImbalance(
                "allocation outside of any scope",
            ));
        };
        let start = align_up(self.offset, ARENA_ALIGNMENT);
        // Zero-sized buffers still get a private address.
        let end = start.and_then(|start| start.checked_add(size.max(1)));
        let (start, end) = match (start, end) {
            (Some(start), Some(end)) if end <= self.heap.size => (start, end),
            _ => {
                return Err(OrchestrationError::CapacityExceeded {
                    capacity: Capacity::Arena,
                    requested: size,
                    available: self.heap.size.saturating_sub(self.offset),
                });
            }
        };
        let version = self.next_version;
        self.next_version = version
            .checked_add(1)
            .expect("ScopedArena::allocate: version space exhausted");
        let addr = self.heap.base + start;
        let handle = BufferHandle::arena(addr, size, version, frame.depth);
        frame.buffers.push(handle);
        self.live.insert(addr, version);
        self.offset = end;
        self.peak = self.peak.max(end);
        trace!(addr, size, version, depth = frame.depth, "arena allocation");
        Ok(handle)
    }

    /// Close the innermost scope and reclaim everything allocated in it.
    ///
    /// # Errors
    /// `ScopeImbalance` when no scope is open.
    pub fn close_scope(&mut self) -> Result<ReclaimedScope> {
        let frame = self
            .scopes
            .pop()
            .ok_or(OrchestrationError::ScopeImbalance("close without matching open"))?;
        let range = self.heap.base + frame.mark..self.heap.base + self.offset;
        for buffer in &frame.buffers {
            let addr = buffer.addr().expect("ScopedArena::close_scope: [1]");
            let removed = self.live.remove(&addr);
            assert_eq!(removed, Some(buffer.version()), "ScopedArena::close_scope: [2]");
        }
        self.offset = frame.mark;
        debug!(
            depth = frame.depth,
            reclaimed = range.end - range.start,
            buffers = frame.buffers.len(),
            "scope closed"
        );
        Ok(ReclaimedScope {
            depth: frame.depth,
            range,
            buffers: frame.buffers,
        })
    }

    /// Whether `handle` still names a live arena allocation. External buffers
    /// are always live as far as the arena is concerned.
    #[must_use]
    pub fn is_live(&self, handle: &BufferHandle) -> bool {
        match (handle.origin(), handle.addr()) {
            (Origin::External, _) => true,
            (Origin::Arena(_), Some(addr)) => self.live.get(&addr) == Some(&handle.version()),
            (Origin::Arena(_), None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAP: HeapRegion = HeapRegion {
        base: 0x10_0000,
        size: 4096,
    };

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut arena = ScopedArena::new(HEAP, 4);
        arena.open_scope().unwrap();
        let a = arena.allocate(10).unwrap();
        let b = arena.allocate(100).unwrap();
        assert_eq!(a.addr(), Some(HEAP.base));
        assert_eq!(b.addr(), Some(HEAP.base + 64));
        assert_eq!(arena.used(), 164);
        assert_ne!(a.version(), b.version());
    }

    #[test]
    fn close_reclaims_only_inner_buffers() {
        let mut arena = ScopedArena::new(HEAP, 4);
        arena.open_scope().unwrap();
        let outer = arena.allocate(64).unwrap();
        arena.open_scope().unwrap();
        let inner = arena.allocate(64).unwrap();
        let reclaimed = arena.close_scope().unwrap();
        assert_eq!(reclaimed.depth, 2);
        assert_eq!(reclaimed.buffers, vec![inner]);
        assert_eq!(reclaimed.range, HEAP.base + 64..HEAP.base + 128);
        assert!(arena.is_live(&outer));
        assert!(!arena.is_live(&inner));
        assert_eq!(arena.used(), 64);
    }

    #[test]
    fn versions_strictly_increase_at_a_reused_offset() {
        let mut arena = ScopedArena::new(HEAP, 4);
        arena.open_scope().unwrap();
        let mut last = 0;
        for _ in 0..16 {
            arena.open_scope().unwrap();
            let handle = arena.allocate(256).unwrap();
            assert_eq!(handle.addr(), Some(HEAP.base));
            assert!(handle.version() > last);
            last = handle.version();
            arena.close_scope().unwrap();
        }
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut arena = ScopedArena::new(HEAP, 4);
        arena.open_scope().unwrap();
        arena.allocate(4000).unwrap();
        let err = arena.allocate(128).unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::CapacityExceeded {
                capacity: Capacity::Arena,
                requested: 128,
                available: 96,
            }
        ));
    }

    #[test]
    fn rollback_forgets_recent_allocations() {
        let mut arena = ScopedArena::new(HEAP, 4);
        arena.open_scope().unwrap();
        let kept = arena.allocate(64).unwrap();
        let checkpoint = arena.checkpoint();
        let dropped = arena.allocate(64).unwrap();
        arena.rollback(checkpoint);
        assert!(arena.is_live(&kept));
        assert!(!arena.is_live(&dropped));
        assert_eq!(arena.used(), 64);
        assert_eq!(arena.peak(), 128);
        let again = arena.allocate(64).unwrap();
        assert_eq!(again.addr(), dropped.addr());
        assert!(again.version() > dropped.version());
    }

    #[test]
    fn unbalanced_close_and_depth_limit() {
        let mut arena = ScopedArena::new(HEAP, 2);
        assert!(matches!(
            arena.close_scope(),
            Err(OrchestrationError::ScopeImbalance(_))
        ));
        assert!(matches!(
            arena.allocate(1),
            Err(OrchestrationError::ScopeImbalance(_))
        ));
        arena.open_scope().unwrap();
        arena.open_scope().unwrap();
        assert!(matches!(
            arena.open_scope(),
            Err(OrchestrationError::CapacityExceeded {
                capacity: Capacity::ScopeDepth,
                ..
            })
        ));
    }
}
