use crate::stats::ArenaGauges;
use byteorder::{ByteOrder, LittleEndian};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Size of the in-band block header: prev and next sibling offsets, total
/// block size, and the in-use flag, each one little-endian word.
const HEADER_SIZE: usize = 16;

/// Smallest block the arena will carve, header included. Split residues
/// below this are absorbed into the allocated block instead of fragmenting.
pub const MIN_BLOCK: usize = 128;

const OFF_PREV: usize = 0;
const OFF_NEXT: usize = 4;
const OFF_SIZE: usize = 8;
const OFF_FLAGS: usize = 12;

const NIL: u32 = u32::MAX;
const FLAG_IN_USE: u32 = 1;

/// An owned slice of the arena holding one unit of in-flight payload.
///
/// Blocks are move-only tokens: exactly one send queue owns a block at a
/// time, and every path that discards one must hand it back through
/// [`PacketArena::release`]. The optional destination address labels
/// reverse-path UDP datagrams.
#[derive(Debug)]
pub struct PacketBlock {
    off: u32,
    len: u32,
    sent: u32,
    pub dest: Option<SocketAddr>,
}

impl PacketBlock {
    /// Payload length written at commit time.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Bytes of the payload already sent.
    #[inline]
    pub fn sent(&self) -> usize {
        self.sent as usize
    }

    /// Bytes of the payload still waiting to be sent.
    #[inline]
    pub fn remaining(&self) -> usize {
        (self.len - self.sent) as usize
    }

    #[inline]
    pub fn is_sent(&self) -> bool {
        self.sent == self.len
    }

    /// Records `count` more payload bytes as sent.
    #[inline]
    pub fn advance(&mut self, count: usize) {
        let sent = self.sent + count as u32;
        assert!(sent <= self.len, "advanced past the payload length");
        self.sent = sent;
    }
}

/// Fixed-capacity packet allocator shared by every tunnel of the process.
///
/// The backing buffer is partitioned into a doubly-linked list of
/// variable-sized blocks addressed by offset; headers live in-band. Free
/// neighbours coalesce immediately on release, so no two adjacent free
/// blocks ever exist, and a roaming hint keeps allocation O(1) in the
/// common case. Running out of space is an expected, recoverable condition:
/// readers stop draining their sockets and resume once blocks come back.
pub struct PacketArena {
    mem: Box<[u8]>,
    free_hint: u32,
    reserved: Option<(u32, usize)>,
    in_use_bytes: usize,
    free_bytes: usize,
    in_use_blocks: usize,
    gauges: Arc<ArenaGauges>,
}

impl PacketArena {
    pub fn new(capacity: usize, gauges: Arc<ArenaGauges>) -> PacketArena {
        assert!(
            capacity > MIN_BLOCK && capacity < NIL as usize,
            "arena capacity out of range: {}",
            capacity
        );

        let mut arena = PacketArena {
            mem: vec![0u8; capacity].into_boxed_slice(),
            free_hint: 0,
            reserved: None,
            in_use_bytes: 0,
            free_bytes: capacity,
            in_use_blocks: 0,
            gauges,
        };

        arena.set_prev(0, NIL);
        arena.set_next(0, NIL);
        arena.set_size(0, capacity as u32);
        arena.set_in_use(0, false);
        arena.sync_gauges();

        arena
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mem.len()
    }

    /// Bytes currently allocated, block headers included.
    #[inline]
    pub fn in_use_bytes(&self) -> usize {
        self.in_use_bytes
    }

    #[inline]
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    #[inline]
    pub fn in_use_blocks(&self) -> usize {
        self.in_use_blocks
    }

    /// Returns a writable view of `hint` payload bytes inside a free block,
    /// or `None` when no free block is large enough. Space is consumed only
    /// by the following [`commit`](PacketArena::commit).
    pub fn reserve(&mut self, hint: usize) -> Option<&mut [u8]> {
        assert!(hint > 0 && hint < NIL as usize - HEADER_SIZE);

        if self.free_hint == NIL {
            return None;
        }

        let need = (hint + HEADER_SIZE) as u32;

        if self.size(self.free_hint) < need {
            match self.find_free(need) {
                Some(off) => self.free_hint = off,
                None => return None,
            }
        }

        let off = self.free_hint;
        self.reserved = Some((off, hint));

        let payload = off as usize + HEADER_SIZE;
        Some(&mut self.mem[payload..payload + hint])
    }

    /// Turns the most recent [`reserve`](PacketArena::reserve) into an owned
    /// block of `len` payload bytes, splitting off the unused tail when the
    /// residue can stand as a block of its own.
    pub fn commit(&mut self, len: usize) -> PacketBlock {
        let (off, hint) = self.reserved.take().expect("commit without a reserve");
        assert!(len <= hint, "commit longer than the reserved view");

        let block_size = self.size(off);
        let wanted = (len + HEADER_SIZE).max(MIN_BLOCK) as u32;
        let residue = block_size - wanted;

        if residue >= MIN_BLOCK as u32 {
            // Split: the tail becomes a new free block.
            let tail = off + wanted;
            let old_next = self.next(off);

            self.set_prev(tail, off);
            self.set_next(tail, old_next);
            self.set_size(tail, residue);
            self.set_in_use(tail, false);

            if old_next != NIL {
                self.set_prev(old_next, tail);
            }

            self.set_next(off, tail);
            self.set_size(off, wanted);
            self.free_hint = tail;
        } else {
            // The whole block goes out; move the hint to the next free one.
            self.free_hint = self.next_free_from(self.next(off), off);
        }

        self.set_in_use(off, true);

        let size = self.size(off) as usize;
        self.in_use_bytes += size;
        self.free_bytes -= size;
        self.in_use_blocks += 1;
        self.sync_gauges();

        PacketBlock {
            off,
            len: len as u32,
            sent: 0,
            dest: None,
        }
    }

    /// Returns a block to the arena, coalescing it with free neighbours.
    pub fn release(&mut self, block: PacketBlock) {
        let off = block.off;
        assert!(self.in_use(off), "released a block that is not in use");

        let size = self.size(off) as usize;
        self.in_use_bytes -= size;
        self.free_bytes += size;
        self.in_use_blocks -= 1;

        self.set_in_use(off, false);

        if self.free_hint == NIL {
            // The arena was fully allocated, so both neighbours are in use
            // and there is nothing to coalesce.
            self.free_hint = off;
            self.sync_gauges();
            return;
        }

        // Merge the next sibling into this block.
        let next = self.next(off);
        if next != NIL && !self.in_use(next) {
            self.set_size(off, self.size(off) + self.size(next));
            let after = self.next(next);
            self.set_next(off, after);
            if after != NIL {
                self.set_prev(after, off);
            }
            if self.free_hint == next {
                self.free_hint = off;
            }
        }

        // Merge this block into the previous sibling.
        let prev = self.prev(off);
        if prev != NIL && !self.in_use(prev) {
            self.set_size(prev, self.size(prev) + self.size(off));
            let after = self.next(off);
            self.set_next(prev, after);
            if after != NIL {
                self.set_prev(after, prev);
            }
            if self.free_hint == off {
                self.free_hint = prev;
            }
        }

        self.sync_gauges();
    }

    /// The committed payload of a block.
    #[inline]
    pub fn filled(&self, block: &PacketBlock) -> &[u8] {
        let payload = block.off as usize + HEADER_SIZE;
        &self.mem[payload..payload + block.len as usize]
    }

    /// The unsent tail of a block's payload.
    #[inline]
    pub fn pending(&self, block: &PacketBlock) -> &[u8] {
        let payload = block.off as usize + HEADER_SIZE;
        &self.mem[payload + block.sent as usize..payload + block.len as usize]
    }

    /// Forward scan for a free block of at least `need` bytes: from the hint
    /// onward first, then from the arena head back up to the hint.
    fn find_free(&self, need: u32) -> Option<u32> {
        let mut p = self.next(self.free_hint);
        while p != NIL {
            if !self.in_use(p) && self.size(p) >= need {
                return Some(p);
            }
            p = self.next(p);
        }

        let mut p = 0;
        while p != self.free_hint {
            if !self.in_use(p) && self.size(p) >= need {
                return Some(p);
            }
            p = self.next(p);
        }

        None
    }

    /// First free block at or after `start`, wrapping from the head up to
    /// (but not including) `stop`. `NIL` when the arena is fully allocated.
    fn next_free_from(&self, start: u32, stop: u32) -> u32 {
        let mut p = start;
        while p != NIL {
            if !self.in_use(p) {
                return p;
            }
            p = self.next(p);
        }

        let mut p = 0;
        while p != stop {
            if !self.in_use(p) {
                return p;
            }
            p = self.next(p);
        }

        NIL
    }

    fn sync_gauges(&self) {
        self.gauges
            .in_use_bytes
            .store(self.in_use_bytes as u64, Ordering::Relaxed);
        self.gauges
            .free_bytes
            .store(self.free_bytes as u64, Ordering::Relaxed);
        self.gauges
            .in_use_blocks
            .store(self.in_use_blocks as u64, Ordering::Relaxed);
    }

    #[inline]
    fn word(&self, off: u32, field: usize) -> u32 {
        let at = off as usize + field;
        LittleEndian::read_u32(&self.mem[at..at + 4])
    }

    #[inline]
    fn set_word(&mut self, off: u32, field: usize, value: u32) {
        let at = off as usize + field;
        LittleEndian::write_u32(&mut self.mem[at..at + 4], value);
    }

    #[inline]
    fn prev(&self, off: u32) -> u32 {
        self.word(off, OFF_PREV)
    }

    #[inline]
    fn next(&self, off: u32) -> u32 {
        self.word(off, OFF_NEXT)
    }

    #[inline]
    fn size(&self, off: u32) -> u32 {
        self.word(off, OFF_SIZE)
    }

    #[inline]
    fn in_use(&self, off: u32) -> bool {
        self.word(off, OFF_FLAGS) & FLAG_IN_USE != 0
    }

    #[inline]
    fn set_prev(&mut self, off: u32, value: u32) {
        self.set_word(off, OFF_PREV, value)
    }

    #[inline]
    fn set_next(&mut self, off: u32, value: u32) {
        self.set_word(off, OFF_NEXT, value)
    }

    #[inline]
    fn set_size(&mut self, off: u32, value: u32) {
        self.set_word(off, OFF_SIZE, value)
    }

    #[inline]
    fn set_in_use(&mut self, off: u32, value: bool) {
        self.set_word(off, OFF_FLAGS, if value { FLAG_IN_USE } else { 0 })
    }

    /// Walks the sibling list and panics on any violated structural
    /// invariant: broken links, a partition that does not cover the buffer,
    /// adjacent free blocks, or a dangling free hint.
    #[cfg(test)]
    pub fn verify(&self) {
        let mut covered = 0usize;
        let mut free = 0usize;
        let mut in_use = 0usize;
        let mut prev = NIL;
        let mut prev_free = false;
        let mut hint_seen = self.free_hint == NIL;
        let mut p = 0;

        while p != NIL {
            assert_eq!(self.prev(p), prev, "broken prev link at {}", p);
            assert_eq!(p as usize, covered, "partition gap at {}", p);

            let size = self.size(p) as usize;
            assert!(size >= MIN_BLOCK, "undersized block at {}", p);
            covered += size;

            if self.in_use(p) {
                in_use += size;
                prev_free = false;
            } else {
                assert!(!prev_free, "adjacent free blocks at {}", p);
                free += size;
                prev_free = true;
            }

            if p == self.free_hint {
                assert!(!self.in_use(p), "free hint points at an in-use block");
                hint_seen = true;
            }

            prev = p;
            p = self.next(p);
        }

        assert!(hint_seen, "free hint points outside the sibling list");
        assert_eq!(covered, self.mem.len(), "partition does not cover arena");
        assert_eq!(free, self.free_bytes);
        assert_eq!(in_use, self.in_use_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    fn arena(capacity: usize) -> PacketArena {
        PacketArena::new(capacity, Arc::new(ArenaGauges::new()))
    }

    fn alloc(arena: &mut PacketArena, len: usize) -> PacketBlock {
        let view = arena.reserve(len).expect("arena exhausted");
        for (i, byte) in view.iter_mut().enumerate() {
            *byte = i as u8;
        }
        arena.commit(len)
    }

    #[test]
    fn test_new_arena_is_one_free_block() {
        let arena = arena(4096);

        assert_eq!(arena.free_bytes(), 4096);
        assert_eq!(arena.in_use_bytes(), 0);
        assert_eq!(arena.in_use_blocks(), 0);
        arena.verify();
    }

    #[test]
    fn test_commit_splits_and_release_coalesces() {
        let mut arena = arena(4096);

        let block = alloc(&mut arena, 200);
        assert_eq!(block.len(), 200);
        assert_eq!(arena.in_use_blocks(), 1);
        assert_eq!(arena.in_use_bytes(), 200 + HEADER_SIZE);
        arena.verify();

        assert_eq!(arena.filled(&block), &{
            let mut expect = vec![0u8; 200];
            for (i, byte) in expect.iter_mut().enumerate() {
                *byte = i as u8;
            }
            expect
        }[..]);

        arena.release(block);
        assert_eq!(arena.free_bytes(), 4096);
        assert_eq!(arena.in_use_blocks(), 0);
        arena.verify();
    }

    #[test]
    fn test_small_commit_takes_min_block() {
        let mut arena = arena(1024);

        let block = alloc(&mut arena, 1);
        assert_eq!(arena.in_use_bytes(), MIN_BLOCK);
        arena.verify();

        arena.release(block);
        arena.verify();
    }

    #[test]
    fn test_residue_below_min_is_absorbed() {
        let mut arena = arena(MIN_BLOCK * 2);

        // Leave a residue smaller than MIN_BLOCK; the allocation must absorb
        // the whole arena.
        let block = alloc(&mut arena, MIN_BLOCK + 1);
        assert_eq!(arena.in_use_bytes(), MIN_BLOCK * 2);
        assert_eq!(arena.free_bytes(), 0);
        arena.verify();

        arena.release(block);
        assert_eq!(arena.free_bytes(), MIN_BLOCK * 2);
        arena.verify();
    }

    #[test]
    fn test_reserve_fails_when_exhausted_and_recovers() {
        let mut arena = arena(MIN_BLOCK * 4);

        let a = alloc(&mut arena, MIN_BLOCK - HEADER_SIZE);
        let b = alloc(&mut arena, MIN_BLOCK - HEADER_SIZE);
        let c = alloc(&mut arena, MIN_BLOCK - HEADER_SIZE);
        let d = alloc(&mut arena, MIN_BLOCK - HEADER_SIZE);
        assert_eq!(arena.free_bytes(), 0);
        assert!(arena.reserve(1).is_none());
        arena.verify();

        arena.release(b);
        arena.verify();
        let e = alloc(&mut arena, MIN_BLOCK - HEADER_SIZE);

        for block in vec![a, c, d, e] {
            arena.release(block);
        }
        assert_eq!(arena.free_bytes(), MIN_BLOCK * 4);
        arena.verify();
    }

    #[test]
    fn test_release_merges_both_neighbours() {
        let mut arena = arena(MIN_BLOCK * 8);

        let a = alloc(&mut arena, MIN_BLOCK - HEADER_SIZE);
        let b = alloc(&mut arena, MIN_BLOCK - HEADER_SIZE);
        let c = alloc(&mut arena, MIN_BLOCK - HEADER_SIZE);

        arena.release(a);
        arena.verify();
        arena.release(c);
        arena.verify();

        // Releasing the middle block must merge left and right into the
        // trailing free region.
        arena.release(b);
        assert_eq!(arena.free_bytes(), MIN_BLOCK * 8);
        assert_eq!(arena.in_use_blocks(), 0);
        arena.verify();
    }

    #[test]
    fn test_pending_tracks_partial_sends() {
        let mut arena = arena(4096);
        let mut block = alloc(&mut arena, 100);

        assert_eq!(arena.pending(&block).len(), 100);
        block.advance(60);
        assert_eq!(arena.pending(&block).len(), 40);
        assert_eq!(arena.pending(&block)[0], 60);
        assert!(!block.is_sent());

        block.advance(40);
        assert!(block.is_sent());
        arena.release(block);
    }

    #[test]
    #[should_panic(expected = "commit without a reserve")]
    fn test_commit_without_reserve_panics() {
        let mut arena = arena(4096);
        arena.commit(1);
    }

    #[test]
    fn test_randomized_churn_preserves_partition() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut arena = arena(64 * 1024);
        let mut live: Vec<PacketBlock> = Vec::new();

        for _ in 0..2000 {
            if rng.gen_bool(0.6) || live.is_empty() {
                let len = rng.gen_range(1..=2048);
                if let Some(view) = arena.reserve(len) {
                    view[0] = 0xaa;
                    live.push(arena.commit(len));
                }
            } else {
                let at = rng.gen_range(0..live.len());
                let block = live.swap_remove(at);
                arena.release(block);
            }
            arena.verify();
        }

        for block in live {
            arena.release(block);
        }
        assert_eq!(arena.free_bytes(), 64 * 1024);
        arena.verify();
    }
}
