#![cfg(test)]
extern crate std;

use core::{ptr::NonNull, slice};

use alloc::vec::Vec;
use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{AllocError, AllocInitError, BuddyArena, Global, Raw};

/// 4 KiB pages, 1 MiB arena.
type PageArena = BuddyArena<12, 20, Global>;

/// 64-byte pages, 4 KiB arena; cheap enough for randomized runs.
type SmallArena = BuddyArena<6, 12, Global>;

fn counts<const MIN: usize, const MAX: usize>(
    arena: &BuddyArena<MIN, MAX, Global>,
) -> Vec<(usize, usize)> {
    arena.dump().collect()
}

fn fill(block: NonNull<[u8]>, value: u8) {
    let slice = unsafe { slice::from_raw_parts_mut(block.cast::<u8>().as_ptr(), block.len()) };
    slice.fill(value);
}

fn check_fill(block: NonNull<[u8]>, value: u8) -> bool {
    let slice = unsafe { slice::from_raw_parts(block.cast::<u8>().as_ptr(), block.len()) };
    slice.iter().all(|&b| b == value)
}

// Construction ===============================================================

#[test]
fn fresh_arena_is_one_top_order_block() {
    let arena = PageArena::try_new().unwrap();
    arena.check_invariants();

    for (order, count) in arena.dump() {
        let expected = if order == 20 { 1 } else { 0 };
        assert_eq!(count, expected, "order {} free count", order);
    }
}

#[test]
fn single_block_arena() {
    let mut arena = BuddyArena::<6, 6, Global>::try_new().unwrap();

    let block = arena.alloc(1).unwrap();
    assert_eq!(block.len(), 64);
    assert_eq!(arena.alloc(1), Err(AllocError::OutOfMemory));

    unsafe { arena.free(block.cast()) };
    arena.check_invariants();
}

#[test]
fn inverted_orders_are_rejected() {
    match BuddyArena::<13, 12, Global>::try_new() {
        Err(AllocInitError::InvalidConfig) => (),
        other => panic!("expected InvalidConfig, got {:?}", other),
    }
}

#[test]
fn raw_region_round_trip() {
    let layout = BuddyArena::<6, 12, Raw>::region_layout();
    let region = NonNull::new(unsafe { std::alloc::alloc(layout) }).unwrap();

    let mut arena = unsafe { BuddyArena::<6, 12, Raw>::new_raw(region) };
    arena.check_invariants();

    let block = arena.alloc(256).unwrap();
    fill(block, 0xa5);
    assert!(check_fill(block, 0xa5));

    unsafe { arena.free(block.cast()) };
    arena.check_invariants();

    // Decomposing the arena hands the region back to the caller.
    let recovered = unsafe { arena.into_raw_parts() };
    assert_eq!(recovered, region);

    unsafe { std::alloc::dealloc(recovered.as_ptr(), layout) };
}

#[test]
#[should_panic(expected = "MIN_ORDER <= MAX_ORDER")]
fn new_raw_rejects_inverted_orders() {
    // The configuration assert fires before the region is touched.
    let _ = unsafe { BuddyArena::<13, 12, Raw>::new_raw(NonNull::dangling()) };
}

#[test]
fn region_layout_matches_configuration() {
    let layout = PageArena::region_layout();
    assert_eq!(layout.size(), 1 << 20);
    assert_eq!(layout.align(), 1 << 12);
}

// Allocation =================================================================

#[test]
fn blocks_are_aligned_to_their_size() {
    let mut arena = SmallArena::try_new().unwrap();

    // Learn the base address from a full-arena allocation.
    let whole = arena.alloc(1 << 12).unwrap();
    let base = whole.cast::<u8>().addr().get();
    unsafe { arena.free(whole.cast()) };

    let mut live = Vec::new();
    for size in [1, 64, 65, 128, 500, 1024] {
        let block = arena.alloc(size).unwrap();
        assert!(block.len() >= size);
        assert!(block.len().is_power_of_two());

        let offset = block.cast::<u8>().addr().get() - base;
        assert_eq!(offset % block.len(), 0, "block of {} bytes misaligned", size);

        live.push(block);
        arena.check_invariants();
    }

    for block in live {
        unsafe { arena.free(block.cast()) };
        arena.check_invariants();
    }
}

#[test]
fn sub_page_request_consumes_one_page() {
    let mut arena = PageArena::try_new().unwrap();

    let block = arena.alloc(1).unwrap();
    assert_eq!(block.len(), 1 << 12);
    arena.check_invariants();

    // One page is carved off the bottom; every order below the top holds
    // the upper half shed by a split.
    for (order, count) in arena.dump() {
        let expected = if order == 20 { 0 } else { 1 };
        assert_eq!(count, expected, "order {} free count", order);
    }
}

#[test]
fn oversize_request_is_rejected_untouched() {
    let mut arena = PageArena::try_new().unwrap();
    let before = counts(&arena);

    assert_eq!(arena.alloc((1 << 20) + 1), Err(AllocError::RequestTooLarge));
    assert_eq!(arena.alloc(usize::MAX), Err(AllocError::RequestTooLarge));

    assert_eq!(counts(&arena), before);
    arena.check_invariants();
}

#[test]
fn capacity_is_exhausted_at_order_granularity() {
    let mut arena = PageArena::try_new().unwrap();

    // Eight 128 KiB blocks fill the 1 MiB arena exactly.
    let mut live = Vec::new();
    for _ in 0..8 {
        live.push(arena.alloc(128 * 1024).unwrap());
        arena.check_invariants();
    }

    assert_eq!(arena.alloc(128 * 1024), Err(AllocError::OutOfMemory));

    // Draining the arena merges it back into a single top-order block.
    let base = live[0].cast::<u8>();
    for block in live {
        unsafe { arena.free(block.cast()) };
        arena.check_invariants();
    }

    let whole = arena.alloc(1 << 20).unwrap();
    assert_eq!(whole.cast::<u8>(), base);
    assert_eq!(whole.len(), 1 << 20);
}

// Deallocation ===============================================================

#[test]
fn alloc_free_round_trip_restores_free_lists() {
    let mut arena = PageArena::try_new().unwrap();

    // Fragment the arena a little first.
    let held = arena.alloc(20 * 1024).unwrap();

    for size in [1, 4096, 9000, 256 * 1024] {
        let before = counts(&arena);

        let block = arena.alloc(size).unwrap();
        unsafe { arena.free(block.cast()) };

        assert_eq!(counts(&arena), before, "round trip of {} bytes", size);
        arena.check_invariants();
    }

    unsafe { arena.free(held.cast()) };
}

#[test]
fn buddy_pages_merge_on_free() {
    let mut arena = PageArena::try_new().unwrap();
    let initial = counts(&arena);

    let first = arena.alloc(4096).unwrap();
    let second = arena.alloc(4096).unwrap();

    // Splitting leaves the two pages adjacent and buddy-paired.
    let delta = second.cast::<u8>().addr().get() - first.cast::<u8>().addr().get();
    assert_eq!(delta, 4096);

    unsafe { arena.free(first.cast()) };
    arena.check_invariants();
    unsafe { arena.free(second.cast()) };
    arena.check_invariants();

    assert_eq!(counts(&arena), initial);

    // The same holds with the frees in the opposite order.
    let first = arena.alloc(4096).unwrap();
    let second = arena.alloc(4096).unwrap();
    unsafe { arena.free(second.cast()) };
    unsafe { arena.free(first.cast()) };

    assert_eq!(counts(&arena), initial);
    arena.check_invariants();
}

#[test]
fn blocks_of_unequal_order_do_not_merge() {
    let mut arena = SmallArena::try_new().unwrap();
    let initial = counts(&arena);

    let a = arena.alloc(64).unwrap(); // page 0
    let b = arena.alloc(64).unwrap(); // page 1, buddy of `a`
    let c = arena.alloc(128).unwrap(); // pages 2..4, order-7 buddy of pages 0..2

    unsafe { arena.free(a.cast()) };
    arena.check_invariants();
    unsafe { arena.free(c.cast()) };
    arena.check_invariants();

    // `a`'s page sits one order below `c`'s block; with `b` still live the
    // two free blocks are not buddies and must stay on separate lists.
    let after = counts(&arena);
    assert_eq!(after[0], (6, 1));
    assert_eq!(after[1], (7, 1));

    // Freeing `b` completes a buddy pair at every order in turn.
    unsafe { arena.free(b.cast()) };
    arena.check_invariants();
    assert_eq!(counts(&arena), initial);
}

// Misuse =====================================================================

#[test]
#[should_panic(expected = "double free")]
fn double_free_panics() {
    let mut arena = SmallArena::try_new().unwrap();

    let block = arena.alloc(64).unwrap();
    unsafe { arena.free(block.cast()) };
    unsafe { arena.free(block.cast()) };
}

#[test]
#[should_panic(expected = "unaligned address")]
fn unaligned_free_panics() {
    let mut arena = SmallArena::try_new().unwrap();

    let block = arena.alloc(64).unwrap();
    let skewed = NonNull::new(unsafe { block.cast::<u8>().as_ptr().add(1) }).unwrap();
    unsafe { arena.free(skewed) };
}

#[test]
#[should_panic(expected = "interior to a block")]
fn interior_free_panics() {
    let mut arena = SmallArena::try_new().unwrap();

    let block = arena.alloc(256).unwrap();
    let interior = NonNull::new(unsafe { block.cast::<u8>().as_ptr().add(64) }).unwrap();
    unsafe { arena.free(interior) };
}

// Randomized op sequences ====================================================

#[derive(Clone, Debug)]
enum ArenaOp {
    Alloc { size: usize },
    Free { index: usize },
}

impl Arbitrary for ArenaOp {
    fn arbitrary(g: &mut Gen) -> Self {
        if bool::arbitrary(g) {
            // Sized for SmallArena, biased to exercise oversize rejection.
            ArenaOp::Alloc {
                size: usize::arbitrary(g) % (2 << 12) + 1,
            }
        } else {
            ArenaOp::Free {
                index: usize::arbitrary(g),
            }
        }
    }
}

/// Runs an op sequence, checking structural invariants after every step and
/// that every live block retains its fill until freed.
fn arena_ops_are_mutually_exclusive(ops: Vec<ArenaOp>) -> bool {
    let mut arena = SmallArena::try_new().unwrap();
    let mut live: Vec<(NonNull<[u8]>, u8)> = Vec::new();
    let mut op_id: u8 = 0;

    for op in ops {
        match op {
            ArenaOp::Alloc { size } => match arena.alloc(size) {
                Ok(block) => {
                    if block.len() < size {
                        return false;
                    }
                    fill(block, op_id);
                    live.push((block, op_id));
                }
                Err(AllocError::RequestTooLarge) => {
                    if size <= 1 << 12 {
                        return false;
                    }
                }
                Err(AllocError::OutOfMemory) => (),
            },

            ArenaOp::Free { index } => {
                if live.is_empty() {
                    continue;
                }

                let (block, id) = live.swap_remove(index % live.len());
                if !check_fill(block, id) {
                    return false;
                }
                unsafe { arena.free(block.cast()) };
            }
        }

        op_id = op_id.wrapping_add(1);
        arena.check_invariants();
    }

    // Drain the arena; everything must coalesce back into one block.
    for (block, id) in live.drain(..) {
        if !check_fill(block, id) {
            return false;
        }
        unsafe { arena.free(block.cast()) };
        arena.check_invariants();
    }

    let coalesced = arena.dump().all(|(order, count)| {
        let expected = if order == 12 { 1 } else { 0 };
        count == expected
    });
    coalesced
}

#[test]
fn random_op_sequences_preserve_invariants() {
    let mut qc = QuickCheck::new().max_tests(200);
    qc.quickcheck(arena_ops_are_mutually_exclusive as fn(Vec<ArenaOp>) -> bool);
}

// Version sync ================================================================

#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
