//! Single-flight coordination of Base fetches, keyed by block index.
//!
//! The first caller to claim a block leads its fill; callers arriving while
//! the fill is running get a [`Waiter`], block until the leader is done and
//! then look at the tracker again. A failed fill is not shared: each waiter
//! finds the block still absent and fills it itself.

use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, PoisonError},
};

#[derive(Default, Debug)]
struct Pending {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Pending {
    fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self
                .cond
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
    fn finish(&self) {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }
}

#[derive(Default, Debug)]
pub struct FetchMap {
    pending: spin::Mutex<HashMap<u64, Arc<Pending>>>,
}

impl FetchMap {
    pub fn new() -> Self {
        Self::default()
    }
    /// Lead the fill of `idx`, or get a handle on the fill already running.
    pub fn try_lead(&self, idx: u64) -> Result<Leader<'_>, Waiter> {
        let mut pending = self.pending.lock();
        if let Some(other) = pending.get(&idx) {
            return Err(Waiter(other.clone()));
        }
        let own = Arc::new(Pending::default());
        pending.insert(idx, own.clone());
        Ok(Leader {
            map: self,
            idx,
            pending: own,
        })
    }
    /// Block until no fill of `idx` is in flight.
    pub fn wait(&self, idx: u64) {
        let pending = self.pending.lock().get(&idx).cloned();
        if let Some(pending) = pending {
            pending.wait();
        }
    }
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Held while filling; releases waiters on drop, including by unwinding.
#[derive(Debug)]
pub struct Leader<'a> {
    map: &'a FetchMap,
    idx: u64,
    pending: Arc<Pending>,
}

impl Drop for Leader<'_> {
    fn drop(&mut self) {
        self.map.pending.lock().remove(&self.idx);
        self.pending.finish();
    }
}

#[derive(Debug)]
pub struct Waiter(Arc<Pending>);

impl Waiter {
    pub fn wait(self) {
        self.0.wait();
    }
}
