use std::sync::{Condvar, Mutex};

/// A set of worker ids `[start, start + size)` that threads claim temporarily.
///
/// Mutators that refine a buffer themselves borrow an id from here so that the binding's
/// per-worker remembered set structures are never used by two threads at once.
pub struct FreeIdSet {
    start: usize,
    size: usize,
    free: Mutex<Vec<usize>>,
    released: Condvar,
}

impl FreeIdSet {
    pub fn new(start: usize, size: usize) -> Self {
        assert!(size > 0, "empty id set");
        Self {
            start,
            size,
            // Lowest ids are handed out first.
            free: Mutex::new((start..start + size).rev().collect()),
            released: Condvar::new(),
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Claim an id, blocking while all ids are in use.
    pub fn claim_par_id(&self) -> usize {
        let mut free = self.free.lock().unwrap();
        loop {
            if let Some(id) = free.pop() {
                return id;
            }
            free = self.released.wait(free).unwrap();
        }
    }

    pub fn release_par_id(&self, id: usize) {
        debug_assert!(id >= self.start && id < self.start + self.size);
        let mut free = self.free.lock().unwrap();
        debug_assert!(!free.contains(&id), "id {} released twice", id);
        free.push(id);
        self.released.notify_one();
    }

    pub fn num_free(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}
