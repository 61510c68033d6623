// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Buddy allocator over a process-shared memory segment. The segment header
// and every chunk header live in shared memory and are reachable from any
// process that maps the segment; all mutation happens under the segment's
// own spin lock, so the header is accessed through raw pointers rather than
// borrowed Rust references (mirrors the shared-memory structures in
// `rw_lock.rs`/`spin_lock.rs`, which are the only synchronization this
// allocator trusts).

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::list::ListNode;
use crate::offset::{Base, Offset};
use crate::rw_lock::RwLock;
use crate::shm::{ShmHandle, ShmOpenMode};
use crate::spin_lock::SpinLock;

/// Smallest chunk size class: `1 << MIN_CLASS` = 64 bytes.
pub const MIN_CLASS: u32 = 6;
/// Largest chunk size class: `1 << MAX_CLASS` = 2 GiB.
pub const MAX_CLASS: u32 = 31;

const NUM_CLASSES: usize = (MAX_CLASS - MIN_CLASS + 1) as usize;

fn idx(class: u32) -> usize {
    debug_assert!((MIN_CLASS..=MAX_CLASS).contains(&class));
    (class - MIN_CLASS) as usize
}

/// Position (0-based) of the highest set bit in `x`, i.e. `floor(log2(x))`.
/// `x` must be non-zero. Used so that `1 << (fls(n - 1) + 1)` names the
/// smallest class whose size is at least `n`, with an exact power of two
/// mapping to its own log2 rather than log2 + 1.
fn fls(x: u64) -> u32 {
    debug_assert!(x > 0);
    63 - x.leading_zeros()
}

/// Smallest `c` such that `1 << c >= need`. `need` must be at least 1.
fn class_for(need: u64) -> u32 {
    fls(need - 1) + 1
}

/// Header stored at the front of every chunk (free or active).
///
/// While the chunk is free, `list` links it into `free_list[mclass]`. Once
/// `active` is set, `list`'s address is handed to the caller as the payload
/// pointer — the two states reinterpret the same bytes rather than move them,
/// so an allocated pointer's identity never changes across free/alloc cycles.
#[repr(C)]
struct ChunkHeader {
    mclass: u32,
    active: bool,
    list: ListNode,
}

fn header_bytes() -> usize {
    std::mem::offset_of!(ChunkHeader, list)
}

unsafe fn chunk_header_of(node: *mut ListNode) -> *mut ChunkHeader {
    (node as *mut u8).sub(header_bytes()) as *mut ChunkHeader
}

unsafe fn list_ptr_of(chunk: *mut ChunkHeader) -> *mut ListNode {
    (chunk as *mut u8).add(header_bytes()) as *mut ListNode
}

/// Single instance at offset 0 of the segment. Everything past
/// `first_usable_offset` is partitioned into chunks.
#[repr(C)]
struct SegmentHeader {
    segment_id: u64,
    segment_size: u64,
    first_usable_offset: u64,
    free_list: [ListNode; NUM_CLASSES],
    num_active: [u64; NUM_CLASSES],
    num_free: [u64; NUM_CLASSES],
    lock: SpinLock,
    /// Made available for clients of the allocator; the allocator itself
    /// never acquires this lock.
    client_rw_lock: RwLock,
}

/// Per-class snapshot returned by [`Segment::stats`].
#[derive(Debug, Clone, Copy)]
pub struct ClassStats {
    pub class: u32,
    pub num_active: u64,
    pub num_free: u64,
}

/// A consistent snapshot of a segment's diagnostic counters.
///
/// `total_active`/`total_free` are not stored fields of the segment header;
/// they are derived here by summing the per-class counters taken under the
/// same lock acquisition.
#[derive(Debug, Clone)]
pub struct SegmentStats {
    pub segment_id: u64,
    pub segment_size: u64,
    pub classes: Vec<ClassStats>,
}

impl SegmentStats {
    pub fn total_active(&self) -> u64 {
        self.classes.iter().map(|c| c.num_active).sum()
    }

    pub fn total_free(&self) -> u64 {
        self.classes.iter().map(|c| c.num_free).sum()
    }
}

static SEGMENT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static SEGMENT_NAME_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_segment_id() -> u64 {
    let pid = std::process::id() as u64;
    let seq = SEGMENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    (pid << 32) | (seq & 0xFFFF_FFFF)
}

fn generate_segment_name() -> String {
    let pid = std::process::id();
    let seq = SEGMENT_NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("buddy_segment_{pid}_{seq}")
}

/// Smallest power of two strictly greater than `header_size`, but not less
/// than `1 << MIN_CLASS`. Any chunk placed here or later is naturally
/// aligned and does not overlap the header.
fn first_usable_offset(header_size: u64) -> u64 {
    let min_chunk = 1u64 << MIN_CLASS;
    (1u64 << (fls(header_size) + 1)).max(min_chunk)
}

/// A buddy allocator over a process-shared memory segment.
///
/// Created once per process group with [`Segment::init`]; later-joining
/// processes attach by inheriting the segment's identifier through a
/// separate channel, which is outside this type's contract.
#[derive(Debug)]
pub struct Segment {
    shm: ShmHandle,
    base: Base,
}

// Safety: the segment is process-shared by design and all mutable state
// behind `base` is guarded by `SegmentHeader::lock`.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a fresh segment of `size` bytes, optionally backed by large
    /// pages, and bootstrap its free lists.
    pub fn init(size: u64, huge_pages: bool) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "segment size must be greater than zero",
            ));
        }

        let header_size = std::mem::size_of::<SegmentHeader>() as u64;
        let first_usable = first_usable_offset(header_size);
        if size < first_usable + (1u64 << MIN_CLASS) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "segment too small to carve a single minimum-class chunk",
            ));
        }

        let user_size: usize = size
            .try_into()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "segment size exceeds address space"))?;

        let name = generate_segment_name();
        let shm = ShmHandle::acquire_with_huge_pages(&name, user_size, ShmOpenMode::Create, huge_pages)?;
        let base = Base::new(shm.as_mut_ptr());

        unsafe {
            let hdr = base.as_ptr() as *mut SegmentHeader;
            ptr::write_bytes(hdr as *mut u8, 0, std::mem::size_of::<SegmentHeader>());
            (*hdr).segment_id = next_segment_id();
            (*hdr).segment_size = size;
            (*hdr).first_usable_offset = first_usable;
            (*hdr).lock = SpinLock::new();
            (*hdr).client_rw_lock = RwLock::new();
            for c in MIN_CLASS..=MAX_CLASS {
                let head = &mut (*hdr).free_list[idx(c)] as *mut ListNode;
                ListNode::init(head, base);
            }
        }

        let segment = Self { shm, base };
        unsafe { segment.bootstrap_tiling(first_usable, size) };
        Ok(segment)
    }

    fn header(&self) -> *mut SegmentHeader {
        self.base.as_ptr() as *mut SegmentHeader
    }

    fn free_list_head(&self, class: u32) -> *mut ListNode {
        unsafe { &mut (*self.header()).free_list[idx(class)] as *mut ListNode }
    }

    fn chunk_at(&self, offset: Offset) -> *mut ChunkHeader {
        self.base.addr_of(offset) as *mut ChunkHeader
    }

    fn offset_of_chunk(&self, chunk: *mut ChunkHeader) -> Offset {
        self.base.offset_of(chunk as *const u8)
    }

    /// Partition `[o0, size)` into the largest naturally-aligned power-of-two
    /// chunks that fit, per-class, linking each into its free list.
    unsafe fn bootstrap_tiling(&self, mut o0: u64, size: u64) {
        let hdr = self.header();
        while size - o0 >= (1u64 << MIN_CLASS) {
            let mut c = o0.trailing_zeros().min(MAX_CLASS);
            while o0 + (1u64 << c) > size {
                if c == 0 {
                    break;
                }
                c -= 1;
            }
            if c < MIN_CLASS {
                break;
            }

            let chunk = self.chunk_at(o0);
            (*chunk).mclass = c;
            (*chunk).active = false;
            let head = self.free_list_head(c);
            ListNode::add(self.base, head, list_ptr_of(chunk));
            (*hdr).num_free[idx(c)] += 1;

            o0 += 1u64 << c;
        }
    }

    /// Ensure `free_list[class]` is non-empty by recursively splitting a
    /// larger chunk. Must be called with the lock held. Returns `false` if no
    /// chunk of `class` can be produced.
    unsafe fn ensure_nonempty(&self, class: u32) -> bool {
        let head = self.free_list_head(class);
        if !ListNode::is_empty(head, self.base) {
            return true;
        }
        if class == MAX_CLASS {
            return false;
        }
        if !self.ensure_nonempty(class + 1) {
            return false;
        }

        let hdr = self.header();
        let parent_head = self.free_list_head(class + 1);
        let node = ListNode::pop_front(self.base, parent_head)
            .expect("free_list[class + 1] was just ensured non-empty");
        (*hdr).num_free[idx(class + 1)] -= 1;

        let chunk = chunk_header_of(node);
        let o = self.offset_of_chunk(chunk);
        let buddy_off = o + (1u64 << class);
        let buddy = self.chunk_at(buddy_off);

        (*chunk).mclass = class;
        (*chunk).active = false;
        (*buddy).mclass = class;
        (*buddy).active = false;

        let my_head = self.free_list_head(class);
        ListNode::add(self.base, my_head, list_ptr_of(chunk));
        ListNode::add(self.base, my_head, list_ptr_of(buddy));
        (*hdr).num_free[idx(class)] += 2;
        true
    }

    /// Allocate at least `n` payload bytes. Returns a pointer valid in this
    /// process's address space, or null if no chunk could be produced.
    pub fn alloc(&self, n: usize) -> *mut u8 {
        let need = (n as u64).saturating_add(header_bytes() as u64);
        let mut class = class_for(need);
        if class < MIN_CLASS {
            class = MIN_CLASS;
        }
        if class > MAX_CLASS {
            return ptr::null_mut();
        }

        unsafe {
            let hdr = self.header();
            (*hdr).lock.lock();

            if !self.ensure_nonempty(class) {
                (*hdr).lock.unlock();
                return ptr::null_mut();
            }

            let head = self.free_list_head(class);
            let node = ListNode::pop_front(self.base, head)
                .expect("free_list[class] was just ensured non-empty");
            (*hdr).num_free[idx(class)] -= 1;

            let chunk = chunk_header_of(node);
            debug_assert_eq!((*chunk).mclass, class);
            debug_assert!(!(*chunk).active, "popped chunk was already active");
            (*chunk).active = true;
            (*hdr).num_active[idx(class)] += 1;

            (*hdr).lock.unlock();
            node as *mut u8
        }
    }

    /// Return a chunk previously obtained from [`Segment::alloc`]. A null
    /// pointer is a no-op. Freeing a pointer not obtained from `alloc`, or
    /// freeing the same pointer twice, is undefined behavior.
    pub fn free(&self, p: *mut u8) {
        if p.is_null() {
            return;
        }

        unsafe {
            let node = p as *mut ListNode;
            let mut chunk = chunk_header_of(node);
            let hdr = self.header();

            (*hdr).lock.lock();

            debug_assert!((*chunk).active, "freeing a chunk that is not active");
            let mut class = (*chunk).mclass;
            (*chunk).active = false;
            (*hdr).num_active[idx(class)] -= 1;

            let mut offset = self.offset_of_chunk(chunk);
            let first_usable = (*hdr).first_usable_offset;

            while class < MAX_CLASS {
                let buddy_off = offset ^ (1u64 << class);
                if buddy_off < first_usable {
                    break;
                }
                let buddy = self.chunk_at(buddy_off);
                if (*buddy).active || (*buddy).mclass != class {
                    break;
                }

                ListNode::del(self.base, list_ptr_of(buddy));
                (*hdr).num_free[idx(class)] -= 1;

                let merged_offset = offset & !((1u64 << (class + 1)) - 1);
                let merged = self.chunk_at(merged_offset);
                debug_assert!(merged == chunk || merged == buddy);
                (*merged).mclass = class + 1;
                (*merged).active = false;

                offset = merged_offset;
                class += 1;
                chunk = merged;
            }

            let head = self.free_list_head(class);
            ListNode::add(self.base, head, list_ptr_of(chunk));
            (*hdr).num_free[idx(class)] += 1;

            (*hdr).lock.unlock();
        }
    }

    /// Translate a pointer within this segment to an offset. See
    /// [`crate::offset::Base::offset_of`].
    pub fn offset_of(&self, p: *const u8) -> Offset {
        self.base.offset_of(p)
    }

    /// Translate an offset back to a pointer within this segment. See
    /// [`crate::offset::Base::addr_of`].
    pub fn addr_of(&self, o: Offset) -> *mut u8 {
        self.base.addr_of(o)
    }

    /// The read/write lock made available for use by other clients sharing
    /// this segment. The allocator itself never acquires it.
    pub fn client_rw_lock(&self) -> &RwLock {
        unsafe { &(*self.header()).client_rw_lock }
    }

    /// Take a consistent snapshot of per-class diagnostic counters.
    pub fn stats(&self) -> SegmentStats {
        unsafe {
            let hdr = self.header();
            (*hdr).lock.lock();
            let classes = (MIN_CLASS..=MAX_CLASS)
                .map(|c| ClassStats {
                    class: c,
                    num_active: (*hdr).num_active[idx(c)],
                    num_free: (*hdr).num_free[idx(c)],
                })
                .collect();
            let stats = SegmentStats {
                segment_id: (*hdr).segment_id,
                segment_size: (*hdr).segment_size,
                classes,
            };
            (*hdr).lock.unlock();
            stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ONE_MIB: u64 = 1 << 20;

    #[test]
    fn fls_and_class_for_boundary_behavior() {
        // (1 << MIN_CLASS) - header_bytes bytes yields a MIN_CLASS chunk.
        let n = (1u64 << MIN_CLASS) - header_bytes() as u64;
        let need = n + header_bytes() as u64;
        assert_eq!(class_for(need), MIN_CLASS);

        // One byte more pushes into the next class.
        let need_plus_one = need + 1;
        assert_eq!(class_for(need_plus_one), MIN_CLASS + 1);
    }

    #[test]
    fn init_only_has_no_active_chunks_and_covers_the_segment() {
        let seg = Segment::init(ONE_MIB, false).unwrap();
        let stats = seg.stats();
        assert_eq!(stats.total_active(), 0);

        let first_usable = unsafe { (*seg.header()).first_usable_offset };
        let covered: u64 = stats
            .classes
            .iter()
            .map(|c| c.num_free * (1u64 << c.class))
            .sum();
        assert_eq!(covered, ONE_MIB - first_usable);
    }

    #[test]
    fn alloc_free_cycle_restores_init_state() {
        let seg = Segment::init(ONE_MIB, false).unwrap();
        let before = seg.stats();

        let p = seg.alloc(100);
        assert!(!p.is_null());
        seg.free(p);

        let after = seg.stats();
        for (b, a) in before.classes.iter().zip(after.classes.iter()) {
            assert_eq!(b.num_free, a.num_free);
            assert_eq!(b.num_active, a.num_active);
        }
    }

    #[test]
    fn split_cascade_consumes_one_chunk_and_coalesce_restores_state() {
        let seg = Segment::init(ONE_MIB, false).unwrap();
        let before = seg.stats();
        let first_usable = unsafe { (*seg.header()).first_usable_offset };

        // A request small enough to need MIN_CLASS forces a split cascade
        // all the way down from whatever class the bootstrap populated.
        let p = seg.alloc(40);
        assert!(!p.is_null());

        let after = seg.stats();
        assert_eq!(after.total_active(), 1);
        // Every byte is still accounted for by free chunks plus the one
        // active allocation (invariant I4, byte-coverage form).
        let active_bytes: u64 = 1u64 << MIN_CLASS;
        let free_bytes: u64 = after
            .classes
            .iter()
            .map(|c| c.num_free * (1u64 << c.class))
            .sum();
        assert_eq!(free_bytes + active_bytes, ONE_MIB - first_usable);

        seg.free(p);
        let restored = seg.stats();
        for (b, r) in before.classes.iter().zip(restored.classes.iter()) {
            assert_eq!(b.num_free, r.num_free, "class {} free count diverged", b.class);
            assert_eq!(b.num_active, r.num_active);
        }
    }

    #[test]
    fn exhaustion_consumes_exactly_the_usable_region_in_min_class_units() {
        let seg = Segment::init(ONE_MIB, false).unwrap();
        let first_usable = unsafe { (*seg.header()).first_usable_offset };
        let usable = ONE_MIB - first_usable;
        let min_class_payload = ((1u64 << MIN_CLASS) - header_bytes() as u64) as usize;

        let mut allocations = Vec::new();
        loop {
            let p = seg.alloc(min_class_payload);
            if p.is_null() {
                break;
            }
            allocations.push(p);
        }

        assert_eq!(allocations.len() as u64, usable / (1u64 << MIN_CLASS));
        assert!(seg.alloc(min_class_payload).is_null());

        for p in allocations {
            seg.free(p);
        }
    }

    #[test]
    fn free_of_null_is_a_no_op() {
        let seg = Segment::init(ONE_MIB, false).unwrap();
        let before = seg.stats();
        seg.free(ptr::null_mut());
        let after = seg.stats();
        assert_eq!(before.total_free(), after.total_free());
        assert_eq!(before.total_active(), after.total_active());
    }

    #[test]
    fn request_past_max_class_returns_null() {
        let seg = Segment::init(ONE_MIB, false).unwrap();
        let too_big = (1usize << MAX_CLASS) + 1;
        assert!(seg.alloc(too_big).is_null());
    }

    #[test]
    fn interleaved_allocations_restore_init_state_when_all_freed() {
        let seg = Segment::init(ONE_MIB, false).unwrap();
        let before = seg.stats();

        let mut live = Vec::new();
        let mut size = 1usize;
        for _ in 0..100 {
            size = (size * 7 + 13) % 4096 + 1;
            let p = seg.alloc(size);
            if !p.is_null() {
                live.push(p);
            }
        }

        let half = live.len() / 2;
        for p in live.drain(..half) {
            seg.free(p);
        }

        for _ in 0..50 {
            size = (size * 7 + 13) % 4096 + 1;
            let p = seg.alloc(size);
            if !p.is_null() {
                live.push(p);
            }
        }

        for p in live {
            seg.free(p);
        }

        let after = seg.stats();
        for (b, a) in before.classes.iter().zip(after.classes.iter()) {
            assert_eq!(b.num_free, a.num_free);
            assert_eq!(b.num_active, a.num_active);
        }
    }

    #[test]
    fn segment_too_small_for_one_chunk_is_rejected() {
        let err = Segment::init(1, false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn client_rw_lock_is_independent_of_allocator_state() {
        let seg = Segment::init(ONE_MIB, false).unwrap();
        seg.client_rw_lock().lock();
        seg.client_rw_lock().unlock();
        seg.client_rw_lock().lock_shared();
        seg.client_rw_lock().unlock_shared();
    }
}
