//! Bounds-checked view over the mapped bytes.
//!
//! Other processes write to the same memory while we hold a mapping, so the
//! view never hands out references derived from values it read: every access
//! takes an offset and a length, checks them against the mapped size, and only
//! then touches memory. A failed check is reported as corruption.
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64};

use crate::error::Corruption;

pub struct Segment<'a> {
    base: NonNull<u8>,
    len: usize,
    _marker: PhantomData<&'a mut [u8]>,
}

impl<'a> Segment<'a> {
    /// View over memory owned by this process.
    pub fn new(bytes: &'a mut [u8]) -> Self {
        let len = bytes.len();
        Segment {
            base: NonNull::from(bytes).cast(),
            len,
            _marker: PhantomData,
        }
    }

    /// View over a mapping.
    ///
    /// # Safety
    /// `base` must point to `len` bytes that stay mapped for `'a`, and the
    /// caller must hold the region lock (or be the first writer) while
    /// mutating through the view.
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        Segment {
            base,
            len,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check that `[offset, offset + len)` lies inside the region.
    #[inline]
    pub fn check(&self, offset: usize, len: usize) -> Result<(), Corruption> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(Corruption::OutOfBounds {
                offset,
                len,
                mapped: self.len,
            }),
        }
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, Corruption> {
        self.check(offset, 4)?;
        // Safety: bounds checked above.
        Ok(unsafe { ptr::read_unaligned(self.base.as_ptr().add(offset) as *const u32) })
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<(), Corruption> {
        self.check(offset, 4)?;
        unsafe { ptr::write_unaligned(self.base.as_ptr().add(offset) as *mut u32, value) };
        Ok(())
    }

    pub fn read_i32(&self, offset: usize) -> Result<i32, Corruption> {
        self.read_u32(offset).map(|v| v as i32)
    }

    pub fn write_i32(&mut self, offset: usize, value: i32) -> Result<(), Corruption> {
        self.write_u32(offset, value as u32)
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64, Corruption> {
        self.check(offset, 8)?;
        Ok(unsafe { ptr::read_unaligned(self.base.as_ptr().add(offset) as *const u64) })
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) -> Result<(), Corruption> {
        self.check(offset, 8)?;
        unsafe { ptr::write_unaligned(self.base.as_ptr().add(offset) as *mut u64, value) };
        Ok(())
    }

    /// Copy `N` bytes out of the region.
    pub fn read_array<const N: usize>(&self, offset: usize) -> Result<[u8; N], Corruption> {
        self.check(offset, N)?;
        let mut out = [0u8; N];
        unsafe {
            ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), out.as_mut_ptr(), N);
        }
        Ok(out)
    }

    pub fn bytes(&self, offset: usize, len: usize) -> Result<&[u8], Corruption> {
        self.check(offset, len)?;
        Ok(unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(offset), len) })
    }

    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8], Corruption> {
        self.check(offset, len)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr().add(offset), len) })
    }

    pub fn fill(&mut self, offset: usize, len: usize, byte: u8) -> Result<(), Corruption> {
        self.check(offset, len)?;
        unsafe { ptr::write_bytes(self.base.as_ptr().add(offset), byte, len) };
        Ok(())
    }

    /// Move `len` bytes from `src` to `dst`. The ranges may overlap.
    pub fn copy_within(&mut self, src: usize, dst: usize, len: usize) -> Result<(), Corruption> {
        self.check(src, len)?;
        self.check(dst, len)?;
        unsafe {
            ptr::copy(
                self.base.as_ptr().add(src),
                self.base.as_ptr().add(dst),
                len,
            )
        };
        Ok(())
    }

    /// Atomic view of a naturally aligned u32 field.
    pub fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32, Corruption> {
        self.check(offset, 4)?;
        let ptr = unsafe { self.base.as_ptr().add(offset) };
        if (ptr as usize) % std::mem::align_of::<AtomicU32>() != 0 {
            return Err(Corruption::Misaligned(offset));
        }
        Ok(unsafe { &*(ptr as *const AtomicU32) })
    }

    /// Atomic view of a naturally aligned u64 field.
    pub fn atomic_u64(&self, offset: usize) -> Result<&AtomicU64, Corruption> {
        self.check(offset, 8)?;
        let ptr = unsafe { self.base.as_ptr().add(offset) };
        if (ptr as usize) % std::mem::align_of::<AtomicU64>() != 0 {
            return Err(Corruption::Misaligned(offset));
        }
        Ok(unsafe { &*(ptr as *const AtomicU64) })
    }

    /// Raw pointer to a checked range, for primitives that must live in place.
    pub fn ptr_at(&self, offset: usize, len: usize) -> Result<*mut u8, Corruption> {
        self.check(offset, len)?;
        Ok(unsafe { self.base.as_ptr().add(offset) })
    }
}
