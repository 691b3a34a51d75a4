use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{align_down, align_up, is_aligned};

/// A raw machine address. Arithmetic goes through explicit methods only.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(usize);

impl Address {
    pub const ZERO: Self = Address(0);

    #[inline(always)]
    pub const fn from_usize(raw: usize) -> Self {
        Address(raw)
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Address(ptr as usize)
    }

    #[inline(always)]
    pub fn from_mut_ptr<T>(ptr: *mut T) -> Self {
        Address(ptr as usize)
    }

    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn to_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline(always)]
    pub fn to_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline(always)]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn add(self, bytes: usize) -> Self {
        Address(self.0 + bytes)
    }

    #[inline(always)]
    pub const fn sub(self, bytes: usize) -> Self {
        Address(self.0 - bytes)
    }

    /// Distance in bytes from `lower` up to `self`.
    #[inline(always)]
    pub const fn diff(self, lower: Address) -> usize {
        debug_assert!(self.0 >= lower.0);
        self.0 - lower.0
    }

    #[inline(always)]
    pub const fn align_up(self, align: usize) -> Self {
        Address(align_up(self.0, align))
    }

    #[inline(always)]
    pub const fn align_down(self, align: usize) -> Self {
        Address(align_down(self.0, align))
    }

    #[inline(always)]
    pub const fn is_aligned_to(self, align: usize) -> bool {
        is_aligned(self.0, align)
    }

    /// # Safety
    /// `self` must point to a readable, suitably aligned `T`.
    #[inline(always)]
    pub unsafe fn load<T: Copy>(self) -> T {
        self.to_ptr::<T>().read()
    }

    /// # Safety
    /// `self` must point to writable memory suitably aligned for `T`.
    #[inline(always)]
    pub unsafe fn store<T>(self, value: T) {
        self.to_mut_ptr::<T>().write(value)
    }

    /// Reads a reference slot. Slots may be written by other mutators, so the load is atomic.
    ///
    /// # Safety
    /// `self` must be a word-aligned readable slot.
    #[inline(always)]
    pub unsafe fn load_slot(self) -> Option<ObjectReference> {
        let word = (*self.to_ptr::<AtomicUsize>()).load(Ordering::Relaxed);
        ObjectReference::from_raw_address(Address(word))
    }

    /// # Safety
    /// `self .. self + bytes` must be writable.
    #[inline(always)]
    pub unsafe fn zero(self, bytes: usize) {
        std::ptr::write_bytes(self.to_mut_ptr::<u8>(), 0, bytes)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A reference to a heap object. Never null; a null reference is `None`.
///
/// The reference is the address the allocator returned for the object.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectReference(NonZeroUsize);

impl ObjectReference {
    #[inline(always)]
    pub fn from_raw_address(addr: Address) -> Option<Self> {
        NonZeroUsize::new(addr.as_usize()).map(ObjectReference)
    }

    /// # Safety
    /// `addr` must not be zero.
    #[inline(always)]
    pub unsafe fn from_raw_address_unchecked(addr: Address) -> Self {
        ObjectReference(NonZeroUsize::new_unchecked(addr.as_usize()))
    }

    #[inline(always)]
    pub const fn to_raw_address(self) -> Address {
        Address(self.0.get())
    }

    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0.get()
    }
}

impl fmt::Debug for ObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectReference({:#x})", self.0)
    }
}

/// Opaque host token identifying a thread. The engine only hands it back to the host.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct VMThread(pub Address);

impl VMThread {
    pub const UNINITIALIZED: Self = VMThread(Address::ZERO);
}
