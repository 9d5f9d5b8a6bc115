//! Physical frame allocator.
//!
//! A bitmap covering up to 16 GiB of physical memory in 4 KiB frames (bit
//! set = frame in use). Frames never move; a frame run allocated together
//! is freed together by its owner.
//!
//! At boot every frame starts out reserved; ranges the multiboot memory
//! map declares available are released, then the low megabyte and the
//! loaded kernel image are reserved again.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    error::{KernelError, KernelResult},
    mm::{PhysAddr, PAGE_SIZE},
    sync::SpinLock,
};

/// Number of 32-bit words in the frame bitmap. 128 Ki words track 4 Mi
/// frames, i.e. 16 GiB of physical memory.
const BITMAP_WORDS: usize = 128 * 1024;

const BITS_PER_WORD: usize = 32;

/// Highest frame index the bitmap can describe.
pub const MAX_FRAMES: usize = BITMAP_WORDS * BITS_PER_WORD;

/// The system-wide frame allocator.
pub struct FrameAllocator {
    bitmap: SpinLock<Bitmap>,
    free_frames: AtomicUsize,
}

struct Bitmap {
    words: [u32; BITMAP_WORDS],
}

impl Bitmap {
    #[inline]
    fn is_set(&self, frame: usize) -> bool {
        self.words[frame / BITS_PER_WORD] & (1 << (frame % BITS_PER_WORD)) != 0
    }

    #[inline]
    fn set(&mut self, frame: usize) {
        self.words[frame / BITS_PER_WORD] |= 1 << (frame % BITS_PER_WORD);
    }

    #[inline]
    fn clear(&mut self, frame: usize) {
        self.words[frame / BITS_PER_WORD] &= !(1 << (frame % BITS_PER_WORD));
    }
}

impl FrameAllocator {
    /// Create an allocator with every frame marked in use.
    pub const fn new() -> Self {
        Self {
            bitmap: SpinLock::new(Bitmap {
                words: [u32::MAX; BITMAP_WORDS],
            }),
            free_frames: AtomicUsize::new(0),
        }
    }

    /// Mark `count` frames starting at `addr` as in use.
    ///
    /// The range must currently be free; double-marking is a caller bug
    /// caught in debug builds.
    pub fn mark(&self, addr: PhysAddr, count: usize) {
        let start = addr.frame_index();
        let mut bitmap = self.bitmap.lock();
        for frame in start..start + count {
            debug_assert!(!bitmap.is_set(frame), "frame {:#x} marked twice", frame);
            bitmap.set(frame);
        }
        self.free_frames.fetch_sub(count, Ordering::Relaxed);
    }

    /// Return `count` frames starting at `addr` to the free pool.
    ///
    /// The range must currently be in use.
    pub fn unmark(&self, addr: PhysAddr, count: usize) {
        let start = addr.frame_index();
        let mut bitmap = self.bitmap.lock();
        for frame in start..start + count {
            debug_assert!(bitmap.is_set(frame), "frame {:#x} freed twice", frame);
            bitmap.clear(frame);
        }
        self.free_frames.fetch_add(count, Ordering::Relaxed);
    }

    /// Release a range regardless of its current state. Used only while
    /// translating the boot memory map, where regions may overlap.
    pub fn release(&self, addr: PhysAddr, count: usize) {
        let start = addr.frame_index();
        let mut bitmap = self.bitmap.lock();
        let mut released = 0;
        for frame in start..(start + count).min(MAX_FRAMES) {
            if bitmap.is_set(frame) {
                bitmap.clear(frame);
                released += 1;
            }
        }
        self.free_frames.fetch_add(released, Ordering::Relaxed);
    }

    /// Reserve a range regardless of its current state. Boot-map
    /// counterpart of [`release`](Self::release).
    pub fn reserve(&self, addr: PhysAddr, count: usize) {
        let start = addr.frame_index();
        let mut bitmap = self.bitmap.lock();
        let mut reserved = 0;
        for frame in start..(start + count).min(MAX_FRAMES) {
            if !bitmap.is_set(frame) {
                bitmap.set(frame);
                reserved += 1;
            }
        }
        self.free_frames.fetch_sub(reserved, Ordering::Relaxed);
    }

    /// Find the first run of `count` free frames without claiming it.
    pub fn find_free(&self, count: usize) -> KernelResult<PhysAddr> {
        if count == 0 {
            return Err(KernelError::InvalidArgument);
        }

        let bitmap = self.bitmap.lock();
        let mut run_start = 0;
        let mut run_len = 0;
        let mut frame = 0;

        while frame < MAX_FRAMES {
            let word = bitmap.words[frame / BITS_PER_WORD];

            // Word-granularity fast paths when aligned to a word boundary.
            if frame % BITS_PER_WORD == 0 {
                if word == u32::MAX {
                    run_len = 0;
                    frame += BITS_PER_WORD;
                    continue;
                }
                if word == 0 && count - run_len > BITS_PER_WORD {
                    if run_len == 0 {
                        run_start = frame;
                    }
                    run_len += BITS_PER_WORD;
                    frame += BITS_PER_WORD;
                    continue;
                }
            }

            if word & (1 << (frame % BITS_PER_WORD)) == 0 {
                if run_len == 0 {
                    run_start = frame;
                }
                run_len += 1;
                if run_len == count {
                    return Ok(PhysAddr::new(run_start * PAGE_SIZE));
                }
            } else {
                run_len = 0;
            }
            frame += 1;
        }

        Err(KernelError::OutOfMemory {
            requested: count * PAGE_SIZE,
        })
    }

    /// Allocate the first free run of `count` frames.
    pub fn alloc(&self, count: usize) -> KernelResult<PhysAddr> {
        let addr = self.find_free(count)?;
        self.mark(addr, count);
        Ok(addr)
    }

    /// Free a previously allocated run.
    pub fn free(&self, addr: PhysAddr, count: usize) {
        self.unmark(addr, count);
    }

    /// True when every frame in the range is free.
    pub fn test_region(&self, addr: PhysAddr, count: usize) -> bool {
        let start = addr.frame_index();
        let bitmap = self.bitmap.lock();
        (start..start + count).all(|frame| !bitmap.is_set(frame))
    }

    /// Number of currently free frames.
    pub fn free_frames(&self) -> usize {
        self.free_frames.load(Ordering::Relaxed)
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

static FRAME_ALLOCATOR: FrameAllocator = FrameAllocator::new();

/// The system-wide frame allocator singleton.
pub fn allocator() -> &'static FrameAllocator {
    &FRAME_ALLOCATOR
}

/// Translate the boot memory map into allocator state and reserve the
/// regions the map cannot know about: the low megabyte (BIOS, VGA) and
/// the loaded kernel image.
pub fn init(available: impl Iterator<Item = (PhysAddr, usize)>, kernel_image_end: PhysAddr) {
    let allocator = allocator();

    for (base, length) in available {
        // Clip to page granularity: partial frames are unusable.
        let first = crate::mm::align_up(base.as_usize(), PAGE_SIZE);
        let last = crate::mm::align_down(base.as_usize() + length, PAGE_SIZE);
        if last > first {
            allocator.release(PhysAddr::new(first), (last - first) / PAGE_SIZE);
        }
    }

    // Low memory and the kernel image are never handed out.
    allocator.reserve(PhysAddr::new(0), 0x10_0000 / PAGE_SIZE);
    let image_frames = crate::mm::align_up(kernel_image_end.as_usize(), PAGE_SIZE) / PAGE_SIZE;
    if image_frames > 0x10_0000 / PAGE_SIZE {
        allocator.reserve(
            PhysAddr::new(0x10_0000),
            image_frames - 0x10_0000 / PAGE_SIZE,
        );
    }

    log::info!(
        "frame allocator: {} KiB free",
        allocator.free_frames() * PAGE_SIZE / 1024
    );
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::boxed::Box;

    use super::*;

    fn allocator_with_free_range(frames: usize) -> Box<FrameAllocator> {
        let alloc = Box::new(FrameAllocator::new());
        alloc.release(PhysAddr::new(0), frames);
        alloc
    }

    #[test]
    fn alloc_returns_first_fit() {
        let alloc = allocator_with_free_range(64);
        assert_eq!(alloc.alloc(4).unwrap(), PhysAddr::new(0));
        assert_eq!(alloc.alloc(4).unwrap(), PhysAddr::new(4 * PAGE_SIZE));
    }

    #[test]
    fn alloc_skips_used_frames() {
        let alloc = allocator_with_free_range(64);
        alloc.mark(PhysAddr::new(0), 3);
        assert_eq!(alloc.alloc(2).unwrap(), PhysAddr::new(3 * PAGE_SIZE));
    }

    #[test]
    fn alloc_free_roundtrip_restores_state() {
        let alloc = allocator_with_free_range(256);
        let free_before = alloc.free_frames();
        assert!(alloc.test_region(PhysAddr::new(0), 256));

        let run = alloc.alloc(77).unwrap();
        assert!(!alloc.test_region(run, 77));
        assert_eq!(alloc.free_frames(), free_before - 77);

        alloc.free(run, 77);
        assert_eq!(alloc.free_frames(), free_before);
        assert!(alloc.test_region(PhysAddr::new(0), 256));
    }

    #[test]
    fn run_crossing_word_boundary() {
        // Free frames 30..80 only; a 40-frame run must start at 30 and
        // span two bitmap words.
        let alloc = Box::new(FrameAllocator::new());
        alloc.release(PhysAddr::new(30 * PAGE_SIZE), 50);
        let run = alloc.alloc(40).unwrap();
        assert_eq!(run, PhysAddr::new(30 * PAGE_SIZE));
    }

    #[test]
    fn large_run_uses_whole_word_fast_path() {
        let alloc = allocator_with_free_range(4096);
        let run = alloc.alloc(1000).unwrap();
        assert_eq!(run, PhysAddr::new(0));
        assert!(alloc.test_region(PhysAddr::new(1000 * PAGE_SIZE), 96));
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let alloc = allocator_with_free_range(16);
        assert!(matches!(
            alloc.alloc(17),
            Err(KernelError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn zero_frames_is_invalid() {
        let alloc = allocator_with_free_range(16);
        assert_eq!(alloc.find_free(0), Err(KernelError::InvalidArgument));
    }
}
