use std::sync::atomic::{AtomicPtr, Ordering};

/// A lazily initialized box.  Similar to an `Option<Box<T>>`, but can be initialized atomically.
///
/// Buffer arena segments use it: a segment is created by whichever thread first needs it and
/// lives as long as the arena.
pub struct OnceOptionBox<T> {
    inner: AtomicPtr<T>,
}

impl<T> OnceOptionBox<T> {
    pub fn new() -> OnceOptionBox<T> {
        Self {
            inner: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    pub fn get(&self, order: Ordering) -> Option<&T> {
        let ptr = self.inner.load(order);
        // SAFETY: a non-null pointer always comes from `Box::into_raw` in `get_or_init`,
        // and is only freed by `drop`, which has exclusive access.
        unsafe { ptr.as_ref() }
    }

    pub fn get_or_init(
        &self,
        order_load: Ordering,
        order_store: Ordering,
        init: impl FnOnce() -> T,
    ) -> &T {
        if let Some(get_result) = self.get(order_load) {
            return get_result;
        }

        let new_inner = Box::into_raw(Box::new(init()));
        let cas_result = self.inner.compare_exchange(
            std::ptr::null_mut(),
            new_inner,
            order_store,
            order_load,
        );
        match cas_result {
            Ok(old_inner) => {
                debug_assert!(old_inner.is_null());
                // SAFETY: we just installed `new_inner`.
                unsafe { &*new_inner }
            }
            Err(old_inner) => {
                // Another thread won the race. Ours was never shared.
                drop(unsafe { Box::from_raw(new_inner) });
                unsafe { &*old_inner }
            }
        }
    }
}

impl<T> Default for OnceOptionBox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for OnceOptionBox<T> {
    fn drop(&mut self) {
        let ptr = *self.inner.get_mut();
        if !ptr.is_null() {
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

// The box hands out `&T` to any thread.
unsafe impl<T: Send + Sync> Sync for OnceOptionBox<T> {}
unsafe impl<T: Send> Send for OnceOptionBox<T> {}
