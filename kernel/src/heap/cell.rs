//! The Cell header and the coalescing insert shared by every heap.

use std::ptr::NonNull;

use porpoise_infra::{Linked, Links, List};

use crate::config::ALIGN;

/// A 32-byte-aligned block header. The pointer handed back to callers is
/// `self as *mut u8 + HEADER_SIZE`. A Cell is in exactly one of a heap's
/// two lists at a time; `links` serves both.
#[repr(C)]
pub(crate) struct CellHeader {
    links: Links<CellHeader>,
    size_with_header: usize,
}

unsafe impl Linked for CellHeader {
    fn links(&self) -> &Links<Self> {
        &self.links
    }
    fn links_mut(&mut self) -> &mut Links<Self> {
        &mut self.links
    }
}

pub(crate) const HEADER_SIZE: usize =
    super::align_up_size(std::mem::size_of::<CellHeader>(), ALIGN);

const _: () = assert!(HEADER_SIZE <= ALIGN, "CellHeader grew past one alignment unit");

/// Writes a fresh, unlinked Cell header at `addr` covering `size` bytes
/// (header included).
///
/// # Safety
/// `addr` must be 32-byte aligned and name `size` writable, otherwise
/// unused bytes inside this process's arena backing storage.
pub(crate) unsafe fn write_cell(addr: usize, size: usize) -> NonNull<CellHeader> {
    let ptr = addr as *mut CellHeader;
    unsafe { ptr.write(CellHeader { links: Links::new(), size_with_header: size }) };
    NonNull::new(ptr).expect("cell address must be non-null")
}

pub(crate) fn cell_addr(c: NonNull<CellHeader>) -> usize {
    c.as_ptr() as usize
}

pub(crate) fn cell_size(c: NonNull<CellHeader>) -> usize {
    unsafe { (*c.as_ptr()).size_with_header }
}

pub(crate) fn cell_end(c: NonNull<CellHeader>) -> usize {
    cell_addr(c) + cell_size(c)
}

pub(crate) unsafe fn set_cell_size(c: NonNull<CellHeader>, size: usize) {
    unsafe { (*c.as_ptr()).size_with_header = size };
}

/// Inserts `cell` into the ascending-address-sorted `free` list, merging
/// with a contiguous successor and then a contiguous predecessor.
///
/// # Safety
/// `cell` must be a live, currently-unlinked Cell whose range does not
/// overlap any Cell already in `free`.
pub(crate) unsafe fn coalescing_insert(free: &mut List<CellHeader>, cell: NonNull<CellHeader>) {
    let addr = cell_addr(cell);
    let succ = unsafe { free.iter() }.find(|&c| cell_addr(c) > addr);
    match succ {
        Some(s) => unsafe { free.insert_before(s, cell) },
        None => unsafe { free.push_back(cell) },
    }

    if let Some(next) = unsafe { free.next(cell) } {
        if cell_end(cell) == cell_addr(next) {
            let next_size = cell_size(next);
            unsafe { free.remove(next) };
            unsafe { set_cell_size(cell, cell_size(cell) + next_size) };
        }
    }
    if let Some(prev) = unsafe { free.prev(cell) } {
        if cell_end(prev) == cell_addr(cell) {
            let cell_sz = cell_size(cell);
            unsafe { free.remove(cell) };
            unsafe { set_cell_size(prev, cell_size(prev) + cell_sz) };
        }
    }
}
