//! Lifeguards: value types that own a native handle and enforce that it is
//! either destroyed immediately or handed to the deferred destructor before
//! being dropped.
//!
//! A bare [`Lifeguard`] panics on drop if it still holds a non-null handle —
//! callers must explicitly `retire` it through the native API (immediate
//! destroy for cold metadata) or a [`crate::deferred::DeferredDestructor`]
//! (deferred destroy for everything else). [`NonOwningLifeguard`] wraps a
//! borrowed handle that is never destroyed by this crate.

use ash::vk::Handle;
use std::fmt;
use std::mem;
use std::ops::Deref;

/// An owning wrapper around a native handle with unique (move-only) semantics.
#[repr(transparent)]
pub(crate) struct Lifeguard<T: Handle + Copy>(T);

impl<T: Handle + Copy> Drop for Lifeguard<T> {
    fn drop(&mut self) {
        if self.0.as_raw() != 0 {
            panic!("non-null lifeguard was dropped without being retired");
        }
    }
}

impl<T: Handle + Copy + fmt::Debug> fmt::Debug for Lifeguard<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<T: Handle + Copy> Default for Lifeguard<T> {
    fn default() -> Self {
        Lifeguard::null()
    }
}

impl<T: Handle + Copy> Lifeguard<T> {
    /// Returns a lifeguard around the null handle; dropping it is a no-op.
    pub fn null() -> Lifeguard<T> {
        Lifeguard(Handle::from_raw(0))
    }

    pub fn new(inner: T) -> Lifeguard<T> {
        Lifeguard(inner)
    }

    /// Returns the handle without releasing ownership.
    pub fn get_inner(&self) -> T {
        self.0
    }

    /// Releases the handle to the caller, who becomes responsible for
    /// destroying or re-queueing it.
    pub fn into_inner(mut self) -> T {
        self.take()
    }

    /// Replaces the held handle with the null handle and returns the
    /// previous value.
    pub fn take(&mut self) -> T {
        mem::replace(&mut self.0, T::from_raw(0))
    }

    pub fn is_null(&self) -> bool {
        self.0.as_raw() == 0
    }
}

/// A handle that this crate borrowed but does not own; it is never destroyed
/// through a lifeguard queue.
#[repr(transparent)]
#[derive(Copy, Clone)]
pub(crate) struct NonOwningLifeguard<T: Handle + Copy>(T);

impl<T: Handle + Copy> NonOwningLifeguard<T> {
    pub fn new(inner: T) -> NonOwningLifeguard<T> {
        NonOwningLifeguard(inner)
    }

    pub fn get(&self) -> T {
        self.0
    }
}

pub(crate) struct LifeguardVec<T: Handle + Copy>(Vec<T>);

impl<T: Handle + Copy> LifeguardVec<T> {
    pub fn new() -> LifeguardVec<T> {
        LifeguardVec(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, mut handle: Lifeguard<T>) -> T {
        self.0.push(handle.get_inner());
        handle.into_inner()
    }

    pub fn remove(&mut self, index: usize) -> Lifeguard<T> {
        Lifeguard::new(self.0.remove(index))
    }

    pub fn swap_remove(&mut self, index: usize) -> Lifeguard<T> {
        Lifeguard::new(self.0.swap_remove(index))
    }

    pub fn into_inner(self) -> Vec<T> {
        self.0
    }
}

impl<T: Handle + Copy> Deref for LifeguardVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}
