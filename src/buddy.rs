//! A fixed-arena binary-buddy allocator.

use core::{alloc::Layout, cmp, fmt, mem::ManuallyDrop, ptr, ptr::NonNull};

use alloc::vec::Vec;

#[cfg(feature = "log")]
use log::{debug, trace};

use crate::{AllocError, AllocInitError, BackingAllocator, BasePtr, Global, Raw};

/// The state of the page heading a block, or of an interior page.
///
/// Only the descriptor at a block's lowest page index carries the block's
/// order; descriptors for the interior pages of a multi-page block are
/// `Unused`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum PageState {
    /// This page heads a free block of the given order.
    Free(usize),
    /// This page heads an allocated block of the given order.
    Allocated(usize),
    /// This page is interior to some larger block.
    Unused,
}

/// A page descriptor.
///
/// One exists per minimum-sized page in the arena. The `prev`/`next` fields
/// link the descriptor into the free list for its order while the block it
/// heads is free; both are `None` otherwise.
#[derive(Clone, Debug)]
struct Page {
    state: PageState,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Page {
    const fn unused() -> Page {
        Page {
            state: PageState::Unused,
            prev: None,
            next: None,
        }
    }
}

/// The free list for a single block order, threaded through the page table.
///
/// Lists are doubly linked by page index, so insertion and removal are O(1)
/// given a member's index. No pointers are involved; the page table is the
/// sole owner of all link state.
#[derive(Clone, Debug, Default)]
struct FreeArea {
    head: Option<usize>,
}

impl FreeArea {
    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Pushes the block headed by `index` onto the front of the list.
    fn push(&mut self, pages: &mut [Page], index: usize) {
        if let Some(old_head) = self.head {
            pages[old_head].prev = Some(index);
        }

        pages[index].prev = None;
        pages[index].next = self.head;
        self.head = Some(index);
    }

    /// Removes the block headed by `index`, which must be a list member.
    fn remove(&mut self, pages: &mut [Page], index: usize) {
        match pages[index].prev {
            // Link `prev` forward to `next`.
            Some(p) => pages[p].next = pages[index].next,

            // If there's no previous block, then `index` is the head.
            None => self.head = pages[index].next,
        }

        if let Some(n) = pages[index].next {
            // Link `next` back to `prev`.
            pages[n].prev = pages[index].prev;
        }

        pages[index].prev = None;
        pages[index].next = None;
    }

    /// Removes and returns the block at the head of the list.
    fn pop(&mut self, pages: &mut [Page]) -> Option<usize> {
        let head = self.head?;
        self.remove(pages, head);
        Some(head)
    }

    /// Counts the blocks currently on the list.
    fn count(&self, pages: &[Page]) -> usize {
        let mut n = 0;
        let mut cur = self.head;
        while let Some(index) = cur {
            n += 1;
            cur = pages[index].next;
        }
        n
    }

    #[cfg(test)]
    fn contains(&self, pages: &[Page], index: usize) -> bool {
        let mut cur = self.head;
        while let Some(i) = cur {
            if i == index {
                return true;
            }
            cur = pages[i].next;
        }
        false
    }
}

/// A fixed-arena binary-buddy allocator.
///
/// This takes two const parameters:
/// - `MIN_ORDER` is the log2 of the smallest block size (the page size).
/// - `MAX_ORDER` is the log2 of the arena size.
///
/// These parameters are subject to the following invariants:
/// - `MIN_ORDER` must not exceed `MAX_ORDER`.
/// - `MAX_ORDER` must be less than `usize::BITS`.
///
/// [`try_new`] reports a violation as [`AllocInitError::InvalidConfig`];
/// [`new_raw`] panics.
///
/// For example, the type of an allocator managing a 1 MiB arena in blocks
/// of 4 KiB to 1 MiB would be:
///
/// ```
/// use buddy_arena::{BuddyArena, Global};
///
/// // Page size == 2^12, arena size == 2^20.
/// type PageArena = BuddyArena<12, 20, Global>;
/// # fn main() {}
/// ```
///
/// [`try_new`]: BuddyArena::try_new
/// [`new_raw`]: BuddyArena::new_raw
pub struct BuddyArena<const MIN_ORDER: usize, const MAX_ORDER: usize, A: BackingAllocator> {
    /// Pointer to the region managed by this allocator.
    base: BasePtr,
    /// One descriptor per minimum-sized page.
    pages: Vec<Page>,
    /// Free lists indexed by `order - MIN_ORDER`.
    free_area: Vec<FreeArea>,
    backing_allocator: A,
}

impl<const MIN_ORDER: usize, const MAX_ORDER: usize> BuddyArena<MIN_ORDER, MAX_ORDER, Raw> {
    /// Constructs a new `BuddyArena` from a raw pointer.
    ///
    /// # Panics
    ///
    /// Panics if `MIN_ORDER` and `MAX_ORDER` do not satisfy the invariants
    /// listed in the [type documentation].
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be a pointer to a region that satisfies the [`Layout`]
    ///   returned by [`Self::region_layout()`], and it must be valid for
    ///   reads and writes for the entire size indicated by that `Layout`.
    /// - No other code may access the region while the allocator exists,
    ///   except through blocks returned by [`alloc`].
    ///
    /// [type documentation]: BuddyArena
    /// [`Self::region_layout()`]: Self::region_layout
    /// [`alloc`]: Self::alloc
    pub unsafe fn new_raw(region: NonNull<u8>) -> BuddyArena<MIN_ORDER, MAX_ORDER, Raw> {
        assert!(
            Self::config_valid(),
            "buddy arena requires MIN_ORDER <= MAX_ORDER < usize::BITS"
        );

        ArenaParts::<MIN_ORDER, MAX_ORDER>::new(region).with_backing_allocator(Raw)
    }

    /// Decomposes the allocator into the pointer to its managed region.
    ///
    /// The descriptor table is released; the region itself is returned to
    /// the caller.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is
    /// called; the returned pointer becomes the sole owner of the region
    /// that was used to construct the allocator.
    pub unsafe fn into_raw_parts(self) -> NonNull<u8> {
        let mut this = ManuallyDrop::new(self);
        let region = this.base.ptr;

        unsafe {
            ptr::drop_in_place(&mut this.pages);
            ptr::drop_in_place(&mut this.free_area);
        }

        region
    }
}

impl<const MIN_ORDER: usize, const MAX_ORDER: usize> BuddyArena<MIN_ORDER, MAX_ORDER, Global> {
    /// Constructs a new `BuddyArena` backed by the global allocator.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `MIN_ORDER` and
    /// `MAX_ORDER` do not satisfy the invariants listed in the
    /// [type documentation], and [`AllocInitError::AllocFailed`] if the
    /// region cannot be allocated.
    ///
    /// [type documentation]: BuddyArena
    pub fn try_new() -> Result<BuddyArena<MIN_ORDER, MAX_ORDER, Global>, AllocInitError> {
        if !Self::config_valid() {
            return Err(AllocInitError::InvalidConfig);
        }

        let layout = Self::region_layout();
        let region = NonNull::new(unsafe { alloc::alloc::alloc(layout) })
            .ok_or(AllocInitError::AllocFailed(layout))?;

        Ok(ArenaParts::<MIN_ORDER, MAX_ORDER>::new(region).with_backing_allocator(Global))
    }
}

impl<const MIN_ORDER: usize, const MAX_ORDER: usize, A: BackingAllocator>
    BuddyArena<MIN_ORDER, MAX_ORDER, A>
{
    fn config_valid() -> bool {
        MIN_ORDER <= MAX_ORDER && MAX_ORDER < usize::BITS as usize
    }

    /// The size in bytes of the smallest block.
    pub fn page_size() -> usize {
        1_usize << MIN_ORDER
    }

    /// The size in bytes of the arena.
    pub fn arena_size() -> usize {
        1_usize << MAX_ORDER
    }

    fn num_pages() -> usize {
        1_usize << (MAX_ORDER - MIN_ORDER)
    }

    /// Returns the layout requirements of the region managed by an
    /// allocator of this type.
    ///
    /// # Panics
    ///
    /// Panics if `MIN_ORDER` and `MAX_ORDER` do not satisfy the invariants
    /// listed in the [type documentation].
    ///
    /// [type documentation]: BuddyArena
    pub fn region_layout() -> Layout {
        assert!(
            Self::config_valid(),
            "buddy arena requires MIN_ORDER <= MAX_ORDER < usize::BITS"
        );

        Layout::from_size_align(Self::arena_size(), Self::page_size()).unwrap()
    }

    /// Computes the order of the smallest block that holds `size` bytes.
    ///
    /// Requests smaller than one page are clamped up to `MIN_ORDER`; without
    /// the clamp a sub-page request would index below the free-list array.
    /// Returns `None` if `size` exceeds the arena.
    fn order_for(size: usize) -> Option<usize> {
        if size > Self::arena_size() {
            return None;
        }

        let order = size.next_power_of_two().trailing_zeros() as usize;
        Some(cmp::max(order, MIN_ORDER))
    }

    /// Attempts to allocate a block of at least `size` bytes.
    ///
    /// On success, returns the entire block: `2^k` bytes for the smallest
    /// `k` in `MIN_ORDER..=MAX_ORDER` with `2^k >= size`, aligned to its own
    /// size relative to the arena base. A zero-size request rounds up to one
    /// page. The contents of the block are uninitialized.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::RequestTooLarge`] if `size` exceeds the arena
    /// size, and [`AllocError::OutOfMemory`] if no free block of sufficient
    /// order exists. Neither error mutates any allocator state.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        let order = Self::order_for(size).ok_or_else(|| {
            debug!("rejecting {} byte request: exceeds arena size", size);
            AllocError::RequestTooLarge
        })?;

        // First fit by ascending order; head of list within an order.
        let avail = (order..=MAX_ORDER)
            .find(|&o| !self.free_area[o - MIN_ORDER].is_empty())
            .ok_or_else(|| {
                debug!("out of memory: no free block of order {} or above", order);
                AllocError::OutOfMemory
            })?;

        let index = self.free_area[avail - MIN_ORDER].pop(&mut self.pages).unwrap();

        // Split top-down until the block reaches the target order. The lower
        // half keeps the base address; the upper half joins the free list
        // one order below.
        for o in (order..avail).rev() {
            let upper = index + (1_usize << (o - MIN_ORDER));
            self.pages[upper].state = PageState::Free(o);
            self.free_area[o - MIN_ORDER].push(&mut self.pages, upper);
        }

        self.pages[index].state = PageState::Allocated(order);

        let offset = index << MIN_ORDER;
        trace!("alloc order {} at offset {:#x}", order, offset);

        Ok(self.base.with_offset_and_size(offset, 1_usize << order))
    }

    /// Frees the block referenced by `ptr`.
    ///
    /// The block is eagerly merged with its buddy at each order for as long
    /// as the buddy is free; the merged block keeps the lower of the two
    /// base addresses.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` does not refer to the base of a currently allocated
    /// block: addresses outside the arena, unaligned addresses, addresses
    /// interior to a block, and double frees are all detected. State is
    /// never corrupted by a detected misuse.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a call to [`alloc`] on this arena.
    /// The caller must not access the block after it is freed.
    ///
    /// [`alloc`]: Self::alloc
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let offset = self.base.offset_to(ptr.addr());
        assert!(
            offset < Self::arena_size(),
            "free of address beyond the arena: offset {:#x}",
            offset
        );
        assert_eq!(
            offset & (Self::page_size() - 1),
            0,
            "free of unaligned address: offset {:#x}",
            offset
        );

        let mut index = offset >> MIN_ORDER;
        let mut order = match self.pages[index].state {
            PageState::Allocated(order) => order,
            PageState::Free(_) => panic!("double free at offset {:#x}", offset),
            PageState::Unused => {
                panic!("free of address interior to a block: offset {:#x}", offset)
            }
        };

        // Walk upward, absorbing the buddy at each order while it is free.
        while order < MAX_ORDER {
            let buddy = index ^ (1_usize << (order - MIN_ORDER));
            if self.pages[buddy].state != PageState::Free(order) {
                break;
            }

            self.free_area[order - MIN_ORDER].remove(&mut self.pages, buddy);
            self.pages[buddy].state = PageState::Unused;
            self.pages[index].state = PageState::Unused;

            // The lower-addressed half heads the merged block.
            index = cmp::min(index, buddy);
            order += 1;
        }

        trace!(
            "free at offset {:#x} settled at order {} (index {})",
            offset,
            order,
            index
        );

        self.pages[index].state = PageState::Free(order);
        self.free_area[order - MIN_ORDER].push(&mut self.pages, index);
    }

    /// Reports the number of free blocks at each order.
    ///
    /// Yields one `(order, free_block_count)` pair for each order from
    /// `MIN_ORDER` to `MAX_ORDER` inclusive. Read-only; safe to call
    /// between any two operations.
    pub fn dump(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (MIN_ORDER..=MAX_ORDER).map(move |o| (o, self.free_area[o - MIN_ORDER].count(&self.pages)))
    }
}

impl<const MIN_ORDER: usize, const MAX_ORDER: usize, A: BackingAllocator> Drop
    for BuddyArena<MIN_ORDER, MAX_ORDER, A>
{
    fn drop(&mut self) {
        unsafe {
            self.backing_allocator
                .deallocate(self.base.ptr, Self::region_layout())
        };
    }
}

impl<const MIN_ORDER: usize, const MAX_ORDER: usize, A: BackingAllocator> fmt::Debug
    for BuddyArena<MIN_ORDER, MAX_ORDER, A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BuddyArena({}..={}) ", MIN_ORDER, MAX_ORDER)?;
        f.debug_map().entries(self.dump()).finish()
    }
}

/// Like a `BuddyArena`, but without a `Drop` impl or an associated
/// allocator.
///
/// This assists in tacking on the allocator type parameter because this
/// struct can be moved out of, while `BuddyArena` itself cannot.
struct ArenaParts<const MIN_ORDER: usize, const MAX_ORDER: usize> {
    base: BasePtr,
    pages: Vec<Page>,
    free_area: Vec<FreeArea>,
}

impl<const MIN_ORDER: usize, const MAX_ORDER: usize> ArenaParts<MIN_ORDER, MAX_ORDER> {
    fn with_backing_allocator<A: BackingAllocator>(
        self,
        backing_allocator: A,
    ) -> BuddyArena<MIN_ORDER, MAX_ORDER, A> {
        let ArenaParts {
            base,
            pages,
            free_area,
        } = self;

        BuddyArena {
            base,
            pages,
            free_area,
            backing_allocator,
        }
    }

    /// Builds the descriptor table and free-list array over `region`.
    ///
    /// The configuration must already have been validated. The region is
    /// not read or written; all bookkeeping lives in the returned tables.
    fn new(region: NonNull<u8>) -> ArenaParts<MIN_ORDER, MAX_ORDER> {
        let num_pages = BuddyArena::<MIN_ORDER, MAX_ORDER, Raw>::num_pages();
        let num_orders = MAX_ORDER - MIN_ORDER + 1;

        let mut pages = Vec::new();
        pages.resize(num_pages, Page::unused());

        let mut free_area = Vec::new();
        free_area.resize(num_orders, FreeArea::default());

        // The entire arena starts as one free block of the top order.
        pages[0].state = PageState::Free(MAX_ORDER);
        free_area[MAX_ORDER - MIN_ORDER].push(&mut pages, 0);

        debug!(
            "buddy arena ready: {} pages of {} bytes",
            num_pages,
            1_usize << MIN_ORDER
        );

        ArenaParts {
            base: BasePtr { ptr: region },
            pages,
            free_area,
        }
    }
}

#[cfg(test)]
impl<const MIN_ORDER: usize, const MAX_ORDER: usize, A: BackingAllocator>
    BuddyArena<MIN_ORDER, MAX_ORDER, A>
{
    /// Verifies the block partition and free-list structure of the arena.
    ///
    /// Checks that blocks tile the arena exactly, that every block is
    /// aligned to its own size, that free-list membership agrees with
    /// descriptor state, and that no two free buddies remain unmerged.
    pub(crate) fn check_invariants(&self) {
        let mut index = 0;
        while index < Self::num_pages() {
            let (order, is_free) = match self.pages[index].state {
                PageState::Free(order) => (order, true),
                PageState::Allocated(order) => (order, false),
                PageState::Unused => panic!("page {} is not covered by any block", index),
            };

            assert!(
                (MIN_ORDER..=MAX_ORDER).contains(&order),
                "block at page {} has out-of-range order {}",
                index,
                order
            );

            let span = 1_usize << (order - MIN_ORDER);
            assert_eq!(
                index % span,
                0,
                "block at page {} is misaligned for order {}",
                index,
                order
            );

            for interior in index + 1..index + span {
                assert_eq!(
                    self.pages[interior].state,
                    PageState::Unused,
                    "interior page {} of block at page {} has independent state",
                    interior,
                    index
                );
            }

            assert_eq!(
                self.free_area[order - MIN_ORDER].contains(&self.pages, index),
                is_free,
                "free-list membership of page {} disagrees with its state",
                index
            );

            if is_free && order < MAX_ORDER {
                let buddy = index ^ span;
                assert_ne!(
                    self.pages[buddy].state,
                    PageState::Free(order),
                    "free buddies at pages {} and {} were left unmerged",
                    index,
                    buddy
                );
            }

            index += span;
        }

        // Every list member heads a free block of the list's order.
        for (i, area) in self.free_area.iter().enumerate() {
            let order = MIN_ORDER + i;
            let mut cur = area.head;
            while let Some(idx) = cur {
                assert_eq!(self.pages[idx].state, PageState::Free(order));
                cur = self.pages[idx].next;
            }
        }
    }
}
