//! Per-frame argument scratch
//!
//! One slot per argument plus one for the result. Small values live inline
//! in 16-byte aligned cells; larger ones (structs by value) get a heap block
//! that is reused across calls. Slot addresses stay put between `ensure`
//! and the end of a call, which is what libffi's argument vector needs.

use crate::errors::Result;
use crate::runtime::cdata::NativeBuffer;
use std::mem::size_of;

const INLINE: usize = 16;

#[repr(C, align(16))]
#[derive(Clone, Copy, Default)]
struct Cell([u8; INLINE]);

#[derive(Default)]
pub(crate) struct Slot {
    inline: Cell,
    heap: Option<NativeBuffer>,
}

impl Slot {
    /// Zeroed storage for one value
    pub(crate) fn reserve(&mut self, size: usize, align: usize) -> Result<*mut u8> {
        if size <= INLINE && align <= INLINE {
            self.inline = Cell::default();
            return Ok(self.inline.0.as_mut_ptr());
        }
        let reusable = self
            .heap
            .as_ref()
            .map_or(false, |b| b.len() >= size && b.align() >= align);
        if reusable {
            if let Some(buf) = &self.heap {
                // SAFETY: the block holds at least `size` bytes
                unsafe { std::ptr::write_bytes(buf.as_ptr(), 0, size) };
                return Ok(buf.as_ptr());
            }
        }
        let buf = NativeBuffer::zeroed(size, align)?;
        let ptr = buf.as_ptr();
        self.heap = Some(buf);
        Ok(ptr)
    }
}

#[derive(Default)]
pub(crate) struct ArgScratch {
    slots: Vec<Slot>,
    ret: Slot,
}

impl ArgScratch {
    pub(crate) fn with_params(count: usize) -> Self {
        let mut scratch = Self::default();
        scratch.ensure(count);
        scratch
    }

    /// Grow to at least `count` argument slots; variadic calls add extras
    pub(crate) fn ensure(&mut self, count: usize) {
        if self.slots.len() < count {
            self.slots.resize_with(count, Slot::default);
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&mut self, index: usize) -> &mut Slot {
        self.ensure(index + 1);
        &mut self.slots[index]
    }

    /// Result storage, never smaller than a register image
    pub(crate) fn ret(&mut self, size: usize, align: usize) -> Result<*mut u8> {
        self.ret.reserve(size.max(size_of::<u64>()), align)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_and_heap_slots() {
        let mut scratch = ArgScratch::with_params(2);
        assert_eq!(scratch.capacity(), 2);
        let small = scratch.slot(0).reserve(8, 8).unwrap();
        assert_eq!(small as usize % 16, 0);
        let big = scratch.slot(1).reserve(64, 8).unwrap();
        // heap block is reused for a smaller struct
        let again = scratch.slot(1).reserve(32, 8).unwrap();
        assert_eq!(big, again);
    }

    #[test]
    fn test_grows_for_variadic_extras() {
        let mut scratch = ArgScratch::with_params(1);
        scratch.ensure(4);
        assert_eq!(scratch.capacity(), 4);
        scratch.ensure(2);
        assert_eq!(scratch.capacity(), 4);
    }

    #[test]
    fn test_slots_are_zeroed() {
        let mut scratch = ArgScratch::default();
        let p = scratch.slot(0).reserve(4, 4).unwrap();
        unsafe { *(p as *mut u32) = 0xdead_beef };
        let p = scratch.slot(0).reserve(4, 4).unwrap();
        assert_eq!(unsafe { *(p as *const u32) }, 0);
    }
}
