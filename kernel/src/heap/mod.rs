//! Arena and heap allocator.
//!
//! An [`Allocator`] owns one arena: a single contiguous byte range carved
//! into up to `max_heaps` independent [`HeapHandle`]s. Each heap keeps two
//! doubly linked lists of [`Cell`](cell::CellHeader)s, `free` and
//! `allocated`, built on [`porpoise_infra::List`]. 32-byte alignment,
//! first-fit search, splitting and coalescing follow the same shape as the
//! original target's heap, adapted to run against a boxed byte buffer
//! instead of a fixed physical range.

mod cell;

use std::sync::Mutex;

use porpoise_infra::List;

use crate::config::{ALIGN, MIN_OBJECT_SIZE};
use crate::error::{code, Error};
use crate::{kpanic, report};

use cell::{cell_addr, cell_end, cell_size, set_cell_size, write_cell, CellHeader, HEADER_SIZE};

/// Align `addr` down to the nearest multiple of `align` (`align` a power of two).
pub const fn align_down_size(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

/// Align `addr` up to the nearest multiple of `align` (`align` a power of two).
pub const fn align_up_size(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}

/// True iff `addr` already has the given alignment.
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & (align - 1) == 0
}

/// True iff walking `list` forward by `next` and backward by `prev` agree:
/// every node's `prev` is the node visited immediately before it, and the
/// last node visited has no `next`.
fn linkage_consistent(list: &List<CellHeader>) -> bool {
    let mut prev = None;
    for c in unsafe { list.iter() } {
        if unsafe { list.prev(c) } != prev {
            return false;
        }
        prev = Some(c);
    }
    match prev {
        Some(last) => unsafe { list.next(last) }.is_none(),
        None => true,
    }
}

/// A dense handle into an [`Allocator`]'s heap-descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapHandle(usize);

/// `{total, used, max_used}`, mirroring the role the upstream allocator's
/// `memory_info()` plays for introspection; adds no new allocation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapInfo {
    pub total: usize,
    pub used: usize,
    pub max_used: usize,
}

struct HeapDescriptor {
    active: bool,
    start: usize,
    end: usize,
    declared_size: usize,
    used: usize,
    max_used: usize,
    free: List<CellHeader>,
    allocated: List<CellHeader>,
}

impl HeapDescriptor {
    const fn inactive() -> Self {
        HeapDescriptor {
            active: false,
            start: 0,
            end: 0,
            declared_size: 0,
            used: 0,
            max_used: 0,
            free: List::new(),
            allocated: List::new(),
        }
    }
}

struct State {
    backing: Box<[u8]>,
    arena_lo: usize,
    arena_hi: usize,
    heaps: Vec<HeapDescriptor>,
    current_heap: Option<usize>,
}

impl State {
    fn in_arena(&self, lo: usize, hi: usize) -> bool {
        lo >= self.arena_lo && hi <= self.arena_hi && lo <= hi
    }

    fn descriptor(&self, h: HeapHandle) -> &HeapDescriptor {
        self.heaps.get(h.0).unwrap_or_else(|| kpanic!("invalid heap handle {}", h.0))
    }

    fn descriptor_mut(&mut self, h: HeapHandle) -> &mut HeapDescriptor {
        let len = self.heaps.len();
        self.heaps.get_mut(h.0).unwrap_or_else(|| kpanic!("invalid heap handle {}/{}", h.0, len))
    }

    fn active_descriptor(&self, h: HeapHandle) -> &HeapDescriptor {
        let d = self.descriptor(h);
        if !d.active {
            kpanic!("use of inactive heap {}", h.0);
        }
        d
    }
}

/// Carves `max_heaps` independent heaps out of one arena.
///
/// The backing bytes are an ordinary heap (Rust-heap, not one of the
/// `Allocator`'s own heaps) allocation; `lo`/`hi` in every method below are
/// real addresses inside it, so pointers this type hands back are
/// dereferenceable memory, matching the contract the rest of the runtime
/// (and the application code linking against it) relies on.
pub struct Allocator {
    state: Mutex<State>,
}

impl Allocator {
    /// `init_alloc`: reserves `max_heaps` descriptor slots, 32-byte-aligns
    /// the remaining span inward, and marks every descriptor inactive.
    ///
    /// Fails if `max_heaps == 0` or the usable span after alignment is
    /// smaller than one minimum object.
    pub fn new(arena_size: usize, max_heaps: usize) -> Result<Allocator, Error> {
        if max_heaps == 0 {
            return Err(code::EINVAL);
        }
        let backing = vec![0u8; arena_size].into_boxed_slice();
        let raw_lo = backing.as_ptr() as usize;
        let raw_hi = raw_lo + backing.len();

        // Charge the descriptor table's footprint against the arena even
        // though the table itself lives in `heaps` below, to keep the
        // byte accounting `init_alloc` promises callers.
        let descriptor_bytes = align_up_size(max_heaps * ALIGN, ALIGN);
        let lo = align_up_size(raw_lo + descriptor_bytes, ALIGN);
        let hi = align_down_size(raw_hi, ALIGN);
        if lo >= hi || hi - lo < MIN_OBJECT_SIZE {
            return Err(code::EINVAL);
        }

        let mut heaps = Vec::with_capacity(max_heaps);
        heaps.resize_with(max_heaps, HeapDescriptor::inactive);

        Ok(Allocator {
            state: Mutex::new(State { backing, arena_lo: lo, arena_hi: hi, heaps, current_heap: None }),
        })
    }

    /// The arena's usable `[lo, hi)` range (after descriptor reservation).
    pub fn arena_range(&self) -> (usize, usize) {
        let s = self.state.lock().unwrap();
        (s.arena_lo, s.arena_hi)
    }

    /// `create_heap`: installs a single free Cell covering `[start, end)`
    /// (aligned inward) in the first inactive descriptor.
    pub fn create_heap(&self, start: usize, end: usize) -> Result<HeapHandle, Error> {
        let mut s = self.state.lock().unwrap();
        let start = align_up_size(start, ALIGN);
        let end = align_down_size(end, ALIGN);
        if start >= end || !s.in_arena(start, end) || end - start < MIN_OBJECT_SIZE {
            return Err(code::EINVAL);
        }
        let idx = s.heaps.iter().position(|d| !d.active).ok_or(code::ENOMEM)?;

        let cell = unsafe { write_cell(start, end - start) };
        let d = &mut s.heaps[idx];
        *d = HeapDescriptor::inactive();
        d.active = true;
        d.start = start;
        d.end = end;
        d.declared_size = end - start;
        unsafe { d.free.push_back(cell) };
        Ok(HeapHandle(idx))
    }

    /// Marks the descriptor inactive. Reports (does not panic) if any
    /// Cells remain allocated; clears `current_heap` if it pointed here.
    pub fn destroy_heap(&self, h: HeapHandle) {
        let mut s = self.state.lock().unwrap();
        let d = s.descriptor(h);
        if !d.allocated.is_empty() {
            report!("destroy_heap({}): {} cells still allocated", h.0, d.allocated.len());
        }
        s.heaps[h.0] = HeapDescriptor::inactive();
        if s.current_heap == Some(h.0) {
            s.current_heap = None;
        }
    }

    /// `add_to_heap`: aligns `[start, end)`, verifies it lies in the arena
    /// and is large enough, and folds it into the heap's free list via the
    /// coalescing insert.
    pub fn add_to_heap(&self, h: HeapHandle, start: usize, end: usize) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        let start = align_up_size(start, ALIGN);
        let end = align_down_size(end, ALIGN);
        if start >= end || !s.in_arena(start, end) || end - start < MIN_OBJECT_SIZE {
            return Err(code::EINVAL);
        }
        let cell = unsafe { write_cell(start, end - start) };
        let d = s.descriptor_mut(h);
        if !d.active {
            return Err(code::EINVAL);
        }
        d.declared_size += end - start;
        unsafe { cell::coalescing_insert(&mut d.free, cell) };
        Ok(())
    }

    pub fn set_current_heap(&self, h: HeapHandle) {
        let mut s = self.state.lock().unwrap();
        let _ = s.active_descriptor(h);
        s.current_heap = Some(h.0);
    }

    pub fn current_heap(&self) -> Option<HeapHandle> {
        self.state.lock().unwrap().current_heap.map(HeapHandle)
    }

    /// Request size `n`. Returns null on exhaustion; panics on programmer
    /// error (uninitialised/invalid handle, inactive heap, `n <= 0`).
    pub fn alloc(&self, h: HeapHandle, n: usize) -> *mut u8 {
        if n == 0 {
            kpanic!("alloc: non-positive size");
        }
        let mut s = self.state.lock().unwrap();
        let needed = align_up_size(n + HEADER_SIZE, ALIGN);
        let d = s.descriptor_mut(h);
        if !d.active {
            kpanic!("alloc: inactive heap {}", h.0);
        }

        let found = unsafe { d.free.iter() }.find(|&c| cell_size(c) >= needed);
        let Some(cell) = found else {
            return std::ptr::null_mut();
        };

        let surplus = cell_size(cell) - needed;
        let carved = if surplus >= MIN_OBJECT_SIZE {
            let next = unsafe { d.free.next(cell) };
            unsafe { d.free.remove(cell) };
            let remainder_addr = cell_addr(cell) + needed;
            let remainder = unsafe { write_cell(remainder_addr, surplus) };
            match next {
                Some(next) => unsafe { d.free.insert_before(next, remainder) },
                None => unsafe { d.free.push_back(remainder) },
            }
            unsafe { set_cell_size(cell, needed) };
            cell
        } else {
            unsafe { d.free.remove(cell) };
            cell
        };

        unsafe { d.allocated.push_front(carved) };
        d.used += cell_size(carved);
        d.max_used = d.max_used.max(d.used);
        (cell_addr(carved) + HEADER_SIZE) as *mut u8
    }

    /// Verifies `ptr`, extracts its Cell from `allocated`, and folds it
    /// back into `free` via the coalescing insert. Panics if `ptr` is not
    /// a live allocation from this heap.
    pub fn free(&self, h: HeapHandle, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let addr = ptr as usize;
        if !is_aligned(addr, ALIGN) {
            kpanic!("free: unaligned pointer {:#x}", addr);
        }
        let cell_at = addr - HEADER_SIZE;
        let mut s = self.state.lock().unwrap();
        if !s.in_arena(cell_at, cell_at + HEADER_SIZE) {
            kpanic!("free: pointer {:#x} outside arena", addr);
        }
        let d = s.descriptor_mut(h);
        if !d.active {
            kpanic!("free: inactive heap {}", h.0);
        }
        let cell = unsafe { d.allocated.iter() }
            .find(|&c| cell_addr(c) == cell_at)
            .unwrap_or_else(|| kpanic!("free: pointer {:#x} is not allocated in heap {}", addr, h.0));

        unsafe { d.allocated.remove(cell) };
        d.used -= cell_size(cell);
        unsafe { cell::coalescing_insert(&mut d.free, cell) };
    }

    /// `alloc_fixed`: expands `[start, end)` to alignment, verifies it
    /// overlaps no active heap's allocated Cells, and excises it from
    /// every active heap's free list (trimming or splitting as needed).
    /// Returns the aligned start.
    pub fn alloc_fixed(&self, start: usize, end: usize) -> Result<usize, Error> {
        let mut s = self.state.lock().unwrap();
        let start = align_down_size(start, ALIGN);
        let end = align_up_size(end, ALIGN);
        if start >= end {
            return Err(code::EINVAL);
        }
        for d in s.heaps.iter() {
            if !d.active {
                continue;
            }
            if unsafe { d.allocated.iter() }.any(|c| cell_addr(c) < end && start < cell_end(c)) {
                kpanic!("alloc_fixed: range [{:#x},{:#x}) overlaps a live allocation", start, end);
            }
        }
        for d in s.heaps.iter_mut() {
            if !d.active {
                continue;
            }
            excise(&mut d.free, start, end, &mut d.declared_size);
        }
        Ok(start)
    }

    /// Walks both lists; returns the free byte total if consistent, `None`
    /// (the "`-1`" sentinel in the original protocol) otherwise.
    pub fn check_heap(&self, h: HeapHandle) -> Option<usize> {
        let s = self.state.lock().unwrap();
        let d = s.descriptor(h);
        if !d.active {
            return None;
        }
        if !linkage_consistent(&d.free) || !linkage_consistent(&d.allocated) {
            return None;
        }
        let mut free_bytes = 0usize;
        let mut total = 0usize;
        let mut prev_end: Option<usize> = None;
        for c in unsafe { d.free.iter() } {
            let addr = cell_addr(c);
            let size = cell_size(c);
            if !is_aligned(addr, ALIGN) || size < MIN_OBJECT_SIZE || !s.in_arena(addr, addr + size) {
                return None;
            }
            if let Some(pe) = prev_end {
                // Two free Cells at the same address or touching end-to-start
                // should have coalesced into one; either is a violation.
                if addr <= pe {
                    return None;
                }
            }
            prev_end = Some(addr + size);
            free_bytes += size;
            total += size;
        }
        for c in unsafe { d.allocated.iter() } {
            let addr = cell_addr(c);
            let size = cell_size(c);
            if !is_aligned(addr, ALIGN) || size < MIN_OBJECT_SIZE || !s.in_arena(addr, addr + size) {
                return None;
            }
            total += size;
        }
        if total != d.declared_size {
            return None;
        }
        Some(free_bytes)
    }

    /// Prints header counts then every Cell's address/size/end/prev/next.
    pub fn dump_heap(&self, h: HeapHandle) {
        let s = self.state.lock().unwrap();
        let d = s.descriptor(h);
        report!(
            "heap {}: {} free cells, {} allocated cells, declared {} bytes",
            h.0,
            d.free.len(),
            d.allocated.len(),
            d.declared_size
        );
        for (name, list) in [("free", &d.free), ("allocated", &d.allocated)] {
            for c in unsafe { list.iter() } {
                report!(
                    "  [{}] addr={:#x} size={} end={:#x}",
                    name,
                    cell_addr(c),
                    cell_size(c),
                    cell_end(c)
                );
            }
        }
    }

    /// `{total, used, max_used}` for the heap, mirroring the role
    /// `memory_info()` plays in the upstream allocator.
    pub fn heap_info(&self, h: HeapHandle) -> HeapInfo {
        let s = self.state.lock().unwrap();
        let d = s.descriptor(h);
        HeapInfo { total: d.declared_size, used: d.used, max_used: d.max_used }
    }
}

/// Removes `[start, end)` from a heap's free list, splitting or trimming
/// any Cell it overlaps, and reduces `declared_size` by the excised span.
fn excise(free: &mut List<CellHeader>, start: usize, end: usize, declared_size: &mut usize) {
    let overlapping: Vec<_> =
        unsafe { free.iter() }.filter(|&c| cell_addr(c) < end && start < cell_end(c)).collect();
    for c in overlapping {
        let (c_addr, c_end) = (cell_addr(c), cell_end(c));
        let excise_lo = start.max(c_addr);
        let excise_hi = end.min(c_end);
        *declared_size -= excise_hi - excise_lo;
        unsafe { free.remove(c) };
        if excise_lo > c_addr {
            let left = unsafe { write_cell(c_addr, excise_lo - c_addr) };
            unsafe { free.push_back(left) };
        }
        if excise_hi < c_end {
            let right = unsafe { write_cell(excise_hi, c_end - excise_hi) };
            unsafe { free.push_back(right) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_alloc() -> Allocator {
        Allocator::new(1 << 20, 4).unwrap()
    }

    #[test]
    fn create_and_alloc() {
        let a = new_alloc();
        let (lo, hi) = a.arena_range();
        let h = a.create_heap(lo, lo + 65536).unwrap();
        let p = a.alloc(h, 100);
        assert!(!p.is_null());
        assert!(is_aligned(p as usize, ALIGN));
        assert_eq!(a.check_heap(h).unwrap(), 65536 - align_up_size(100 + HEADER_SIZE, ALIGN));
        let _ = hi;
    }

    #[test]
    fn split_and_coalesce_scenario() {
        let a = new_alloc();
        let (lo, _) = a.arena_range();
        let h = a.create_heap(lo, lo + 65536).unwrap();
        let p1 = a.alloc(h, 100);
        let p2 = a.alloc(h, 200);
        let p3 = a.alloc(h, 100);
        assert!(a.check_heap(h).unwrap() >= 0);
        a.free(h, p1);
        a.free(h, p3);
        assert!(a.check_heap(h).is_some());
        a.free(h, p2);
        assert_eq!(a.check_heap(h), Some(65536));
        let info = a.heap_info(h);
        assert_eq!(info.total, 65536);
        assert_eq!(info.used, 0);
        assert!(info.max_used > 0);
    }

    #[test]
    fn coalesce_builds_single_cell_covering_both_allocations() {
        let a = new_alloc();
        let (lo, _) = a.arena_range();
        let h = a.create_heap(lo, lo + 65536).unwrap();
        let n = 200;
        let p1 = a.alloc(h, n);
        let p2 = a.alloc(h, n);
        a.free(h, p1);
        a.free(h, p2);
        assert_eq!(a.check_heap(h), Some(65536));
    }

    #[test]
    fn exhaustion_returns_null_not_panic() {
        let a = Allocator::new(4096, 1).unwrap();
        let (lo, hi) = a.arena_range();
        let h = a.create_heap(lo, hi).unwrap();
        let n = (hi - lo) - HEADER_SIZE - ALIGN;
        let p = a.alloc(h, n);
        assert!(!p.is_null());
        let p2 = a.alloc(h, 64);
        assert!(p2.is_null());
    }

    #[test]
    #[should_panic]
    fn free_of_untracked_pointer_panics() {
        let a = new_alloc();
        let (lo, _) = a.arena_range();
        let h = a.create_heap(lo, lo + 65536).unwrap();
        a.free(h, (lo + HEADER_SIZE) as *mut u8);
    }

    #[test]
    fn destroy_heap_reports_leaked_cells_without_panicking() {
        let a = new_alloc();
        let (lo, _) = a.arena_range();
        let h = a.create_heap(lo, lo + 65536).unwrap();
        let _leaked = a.alloc(h, 64);
        a.destroy_heap(h);
        assert!(a.current_heap().is_none());
    }
}
