// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Includes helpers for allocating and releasing thread stacks.
//!
//! Each thread's stack is carved out of a single block obtained from the
//! scheduler's allocator. The block is over-allocated by a page so that the
//! usable region can start on a page boundary, and optionally by one more
//! page, which is made inaccessible and sits just below the usable region
//! as a stack guard. The raw block is kept alongside the usable bounds, as
//! it is what must eventually be returned to the allocator.

use crate::scheduler::Error;
use align::{align_ptr_up, is_aligned_usize};
use lazy_static::lazy_static;
use log::warn;
use std::alloc::{GlobalAlloc, Layout};
use std::io;
use std::ptr::NonNull;
use x86_64::structures::paging::{PageSize, Size4KiB};
use x86_64::VirtAddr;

/// The alignment requested for the raw stack allocation.
/// The usable region is always page-aligned regardless.
///
const STACK_ALIGN: usize = 16;

lazy_static! {
    /// The platform page size, queried once.
    ///
    static ref PAGE_SIZE: usize = query_page_size();
}

fn query_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 && (size as usize).is_power_of_two() {
        size as usize
    } else {
        warn!("sysconf(_SC_PAGESIZE) returned {}, assuming 4 KiB pages", size);
        Size4KiB::SIZE as usize
    }
}

/// Returns the platform's page size in bytes.
///
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Describes the address space used for a thread stack.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    start: VirtAddr,
    end: VirtAddr,
}

impl StackBounds {
    /// Returns the bounds of the `size` bytes starting at
    /// `start`.
    ///
    pub fn new(start: VirtAddr, size: usize) -> Self {
        debug_assert!(size > 0);
        StackBounds {
            start,
            end: start + (size as u64 - 1),
        }
    }

    /// Returns the smallest valid address in the stack bounds.
    /// As the stack grows downwards, this is also known as the
    /// bottom of the stack.
    ///
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// Returns the largest valid address in the stack bounds.
    ///
    pub fn end(&self) -> VirtAddr {
        self.end
    }

    /// Returns the address just past the end of the stack,
    /// which is where the stack pointer starts out.
    ///
    pub fn top(&self) -> VirtAddr {
        self.end + 1u64
    }

    /// Returns the number of bytes in the stack.
    ///
    pub fn size(&self) -> usize {
        (self.top() - self.start) as usize
    }

    /// Returns the number of whole pages in the stack.
    ///
    pub fn num_pages(&self) -> usize {
        self.size() / page_size()
    }

    /// Returns whether the stack bounds include the given
    /// address.
    ///
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr <= self.end
    }
}

/// A thread stack and the allocation backing it.
///
#[derive(Debug)]
pub(crate) struct Stack {
    // The block returned by the allocator, which must
    // be returned to it when the stack is freed.
    memory: NonNull<u8>,
    layout: Layout,

    // The inaccessible page below the stack, if any.
    guard: Option<VirtAddr>,

    // The usable, page-aligned region.
    bounds: StackBounds,
}

impl Stack {
    /// Returns the usable region of the stack.
    ///
    pub fn bounds(&self) -> StackBounds {
        self.bounds
    }

    /// Returns the address of the guard page, if the stack
    /// has one.
    ///
    pub fn guard(&self) -> Option<VirtAddr> {
        self.guard
    }

    /// Returns the stack's memory to `allocator`.
    ///
    /// # Safety
    ///
    /// `allocator` must be the allocator the stack was
    /// obtained from, and nothing may be executing on the
    /// stack or hold references into it.
    ///
    pub unsafe fn free(self, allocator: &dyn GlobalAlloc) {
        if let Some(guard) = self.guard {
            // The allocator may hand this memory out again,
            // so it must be accessible once more.
            let ret = libc::mprotect(
                guard.as_mut_ptr(),
                page_size(),
                libc::PROT_READ | libc::PROT_WRITE,
            );
            if ret != 0 {
                // Releasing memory we cannot write to would let
                // the allocator fault later, so leak it instead.
                warn!(
                    "failed to unprotect stack guard at {:p}: {}",
                    guard,
                    io::Error::last_os_error()
                );
                return;
            }
        }

        allocator.dealloc(self.memory.as_ptr(), self.layout);
    }
}

/// Makes the page at `page` inaccessible, returning its
/// address on success.
///
fn protect_guard_page(page: *mut u8) -> Option<VirtAddr> {
    debug_assert!(is_aligned_usize(page as usize, page_size()));
    let ret = unsafe { libc::mprotect(page as *mut libc::c_void, page_size(), libc::PROT_NONE) };
    if ret == 0 {
        Some(VirtAddr::from_ptr(page as *const u8))
    } else {
        warn!(
            "failed to protect stack guard at {:p}, continuing without it: {}",
            page,
            io::Error::last_os_error()
        );
        None
    }
}

/// Allocates a stack of `num_pages` pages from `allocator`,
/// with a guard page below it if `guard_page` is set.
///
/// The returned stack's usable region starts on a page
/// boundary. Fails with [`Error::OutOfMemory`] if the
/// allocator cannot satisfy the request.
///
pub(crate) fn new_stack(
    allocator: &dyn GlobalAlloc,
    num_pages: usize,
    guard_page: bool,
) -> Result<Stack, Error> {
    let page = page_size();
    let size = num_pages.checked_mul(page).ok_or(Error::OutOfMemory)?;
    if size == 0 {
        return Err(Error::OutOfMemory);
    }

    let guard_size = if guard_page { page } else { 0 };
    let total = size
        .checked_add(guard_size)
        .and_then(|total| total.checked_add(page))
        .ok_or(Error::OutOfMemory)?;
    let layout = Layout::from_size_align(total, STACK_ALIGN).map_err(|_| Error::OutOfMemory)?;
    let memory = NonNull::new(unsafe { allocator.alloc(layout) }).ok_or(Error::OutOfMemory)?;

    // Up to a page is lost to alignment, which is
    // why we asked for the extra page.
    let region = align_ptr_up(memory.as_ptr(), page);
    let guard = if guard_page {
        protect_guard_page(region)
    } else {
        None
    };

    let start = VirtAddr::from_ptr(region as *const u8) + guard_size as u64;
    Ok(Stack {
        memory,
        layout,
        guard,
        bounds: StackBounds::new(start, size),
    })
}
