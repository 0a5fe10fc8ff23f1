//! Non-blocking shared frame buffer.
//!
//! A [`FrameSlot`] is a resizable pixel buffer guarded by a single
//! atomic ownership bit. Both readers and writers *try* to take the bit
//! and skip their cycle when it is already held; nobody ever waits. The
//! capture or decode work that feeds a slot happens in private scratch
//! buffers, so the bit is only held for the copy itself.
//!
//! ```text
//!  capture / network thread            consumer thread
//!  ────────────────────────            ───────────────
//!  try_acquire_write() ──┐        ┌── try_acquire_read()
//!      copy / resize     │  bit   │       upload
//!  drop(guard) ──────────┘        └── drop(guard)
//! ```
//!
//! Guards release the bit on drop, so early returns and `?` paths cannot
//! leave a slot locked.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::ChatheadError;
use crate::types::{PixelFormat, Resolution, copy_rows};

// ── FrameSlot ────────────────────────────────────────────────────

struct Frame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
    /// Number of completed writes; 0 means the slot was never filled.
    generation: u64,
}

/// A reusable pixel buffer shared between exactly one writer role and
/// one reader role.
pub struct FrameSlot {
    locked: AtomicBool,
    /// Lock-free mirror of `(width, height)`, only stored while the
    /// write guard is held.
    dims: AtomicU64,
    format: PixelFormat,
    frame: UnsafeCell<Frame>,
}

// SAFETY: every access to `frame` goes through a guard, and a guard only
// exists while `locked` is held by its creator. The acquire/release pair
// on `locked` orders the buffer accesses between threads.
unsafe impl Sync for FrameSlot {}

impl FrameSlot {
    /// Allocate a zero-filled slot of the given size.
    ///
    /// Returns [`ChatheadError::Allocation`] instead of aborting when the
    /// buffer cannot be reserved.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Result<Self, ChatheadError> {
        let pixels = alloc_pixels(format.frame_len(width, height))?;
        Ok(Self {
            locked: AtomicBool::new(false),
            dims: AtomicU64::new(Resolution::new(width, height).pack()),
            format,
            frame: UnsafeCell::new(Frame {
                width,
                height,
                pixels,
                generation: 0,
            }),
        })
    }

    /// Try to take exclusive write access. Never blocks.
    pub fn try_acquire_write(&self) -> Option<WriteGuard<'_>> {
        self.try_lock().then(|| WriteGuard { slot: self })
    }

    /// Try to take read access. Never blocks.
    ///
    /// `None` means another party holds the slot; the caller keeps
    /// showing whatever it copied last time.
    pub fn try_acquire_read(&self) -> Option<ReadGuard<'_>> {
        self.try_lock().then(|| ReadGuard { slot: self })
    }

    /// Current dimensions, readable without the lock.
    pub fn dimensions(&self) -> Resolution {
        Resolution::unpack(self.dims.load(Ordering::Acquire))
    }

    /// Pixel layout of the buffer.
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Whether some party currently holds the slot.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    // ── Internal ─────────────────────────────────────────────────

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl fmt::Debug for FrameSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSlot")
            .field("dimensions", &self.dimensions())
            .field("format", &self.format)
            .field("locked", &self.is_locked())
            .finish()
    }
}

fn alloc_pixels(len: usize) -> Result<Vec<u8>, ChatheadError> {
    let mut pixels = Vec::new();
    pixels
        .try_reserve_exact(len)
        .map_err(|_| ChatheadError::Allocation { bytes: len })?;
    pixels.resize(len, 0);
    Ok(pixels)
}

// ── ReadGuard ────────────────────────────────────────────────────

/// Shared view of a slot's latest completed write.
pub struct ReadGuard<'a> {
    slot: &'a FrameSlot,
}

impl ReadGuard<'_> {
    fn frame(&self) -> &Frame {
        // SAFETY: this guard holds the slot's lock.
        unsafe { &*self.slot.frame.get() }
    }

    pub fn width(&self) -> u32 {
        self.frame().width
    }

    pub fn height(&self) -> u32 {
        self.frame().height
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width(), self.height())
    }

    /// Tightly packed pixel rows, `width * height * bpp` bytes.
    pub fn pixels(&self) -> &[u8] {
        &self.frame().pixels
    }

    /// How many writes completed before this read; 0 if never written.
    pub fn generation(&self) -> u64 {
        self.frame().generation
    }

    /// Release the slot. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Deref for ReadGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.pixels()
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.slot.unlock();
    }
}

// ── WriteGuard ───────────────────────────────────────────────────

/// Exclusive access to a slot for copying a new frame in or resizing it.
pub struct WriteGuard<'a> {
    slot: &'a FrameSlot,
}

impl WriteGuard<'_> {
    fn frame(&self) -> &Frame {
        // SAFETY: this guard holds the slot's lock.
        unsafe { &*self.slot.frame.get() }
    }

    fn frame_mut(&mut self) -> &mut Frame {
        // SAFETY: this guard holds the slot's lock exclusively and is
        // borrowed mutably.
        unsafe { &mut *self.slot.frame.get() }
    }

    pub fn width(&self) -> u32 {
        self.frame().width
    }

    pub fn height(&self) -> u32 {
        self.frame().height
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width(), self.height())
    }

    pub fn generation(&self) -> u64 {
        self.frame().generation
    }

    /// Reallocate the buffer for `width` x `height`.
    ///
    /// Dimensions, buffer and the lock-free mirror all change before the
    /// guard is released, so no reader ever sees them disagree. On
    /// allocation failure the slot keeps its previous size.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), ChatheadError> {
        let pixels = alloc_pixels(self.slot.format.frame_len(width, height))?;
        let frame = self.frame_mut();
        frame.pixels = pixels;
        frame.width = width;
        frame.height = height;
        self.slot
            .dims
            .store(Resolution::new(width, height).pack(), Ordering::Release);
        Ok(())
    }

    /// Replace the contents with a tightly packed frame of the slot's
    /// current size.
    pub fn copy_from(&mut self, src: &[u8]) -> Result<(), ChatheadError> {
        let frame = self.frame_mut();
        if src.len() != frame.pixels.len() {
            return Err(ChatheadError::FrameSizeMismatch {
                expected: frame.pixels.len(),
                actual: src.len(),
            });
        }
        frame.pixels.copy_from_slice(src);
        frame.generation += 1;
        Ok(())
    }

    /// Copy a possibly padded source image, row by row when the source
    /// pitch differs from the slot's tightly packed rows.
    pub fn write_rows(&mut self, src: &[u8], src_stride: usize) -> Result<(), ChatheadError> {
        let bpp = self.slot.format.bytes_per_pixel();
        let frame = self.frame_mut();
        let row_len = frame.width as usize * bpp;
        copy_rows(&mut frame.pixels, row_len, src, src_stride, row_len, frame.height)?;
        frame.generation += 1;
        Ok(())
    }

    /// Mutable access to the raw pixels, for writers that fill in place.
    /// Call [`mark_written`](Self::mark_written) afterwards.
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.frame_mut().pixels
    }

    /// Record that the pixels now hold a complete new frame.
    pub fn mark_written(&mut self) {
        self.frame_mut().generation += 1;
    }

    /// Release the slot. Equivalent to dropping the guard.
    pub fn release(self) {}
}

impl Deref for WriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.frame().pixels
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.slot.unlock();
    }
}

// ── FrameSnapshot ────────────────────────────────────────────────

/// An owned copy of a slot's contents taken under the read lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSnapshot {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub generation: u64,
}

impl FrameSnapshot {
    /// Copy the guarded frame out; `None` if the slot was never written.
    pub fn capture(guard: &ReadGuard<'_>) -> Option<Self> {
        (guard.generation() > 0).then(|| Self {
            width: guard.width(),
            height: guard.height(),
            pixels: guard.pixels().to_vec(),
            generation: guard.generation(),
        })
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

// ── Tests ────────────────────────────────────────────────────────
