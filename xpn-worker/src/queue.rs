/*
 * This file is part of XPN, a striped parallel filesystem.
 *
 * XPN is free software: you can redistribute it and/or modify it under
 * the terms of the GNU Affero General Public License as published by the
 * Free Software Foundation, either version 3 of the License, or (at your
 * option) any later version.
 *
 * XPN is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or
 * FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public
 * License for more details.
 */

//! `FixedTaskQueue` (spec.md §4.8): a bounded ring of in-flight tasks, grounded
//! on `original_source/src/base_cpp/fixed_task_queue.hpp`. The C++ version is a
//! wraparound buffer of slots that blocks a new submission until the slot it
//! would reuse has finished, so that a buffer referenced by an in-flight
//! operation is never reused out from under it. Here each slot holds a
//! `JoinHandle<T>`; submitting into an occupied slot joins the previous
//! occupant first, and `Drop` joins every slot still outstanding.

use std::sync::Mutex;
use std::thread::{self, JoinHandle};

struct Slot<T> {
    handle: Mutex<Option<JoinHandle<T>>>,
}

/// A fixed-capacity ring of task slots. Submitting past capacity blocks on
/// the oldest occupant of the slot being reused, bounding the number of
/// concurrently in-flight tasks without an unbounded queue.
pub struct FixedTaskQueue<T> {
    slots: Vec<Slot<T>>,
    next: Mutex<usize>,
}

impl<T: Send + 'static> FixedTaskQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots = (0..capacity).map(|_| Slot { handle: Mutex::new(None) }).collect();
        Self { slots, next: Mutex::new(0) }
    }

    /// Submit `f`, blocking the caller until the slot being reused (if any)
    /// has finished. Returns the result of whatever task previously occupied
    /// that slot, if any.
    pub fn submit<F>(&self, f: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let idx = {
            let mut next = self.next.lock().unwrap();
            let idx = *next;
            *next = (*next + 1) % self.slots.len();
            idx
        };
        let mut slot = self.slots[idx].handle.lock().unwrap();
        let previous = slot.take().and_then(|h| h.join().ok());
        *slot = Some(thread::spawn(f));
        previous
    }

    /// Block until every outstanding slot has finished, returning their
    /// results in slot order (slots never submitted to are skipped).
    pub fn drain(&self) -> Vec<T> {
        self.slots
            .iter()
            .filter_map(|slot| slot.handle.lock().unwrap().take())
            .filter_map(|h| h.join().ok())
            .collect()
    }
}

impl<T> Drop for FixedTaskQueue<T> {
    fn drop(&mut self) {
        for slot in &self.slots {
            if let Some(handle) = slot.handle.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn reuse_blocks_until_previous_occupant_finishes() {
        let queue: FixedTaskQueue<u32> = FixedTaskQueue::new(2);
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..10u32 {
            let done = Arc::clone(&done);
            // by the time submit() returns for slot reuse, the prior
            // occupant of that slot must already have incremented `done`
            queue.submit(move || {
                thread::sleep(std::time::Duration::from_millis(1));
                done.fetch_add(1, Ordering::SeqCst);
                i
            });
            if i >= 2 {
                assert!(done.load(Ordering::SeqCst) >= i as usize - 1);
            }
        }
        let remaining = queue.drain();
        assert_eq!(done.load(Ordering::SeqCst) + remaining.len(), 10);
    }

    #[test]
    fn drop_waits_for_outstanding_slots() {
        let done = Arc::new(AtomicUsize::new(0));
        {
            let queue: FixedTaskQueue<()> = FixedTaskQueue::new(4);
            for _ in 0..4 {
                let done = Arc::clone(&done);
                queue.submit(move || {
                    thread::sleep(std::time::Duration::from_millis(5));
                    done.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn capacity_is_at_least_one() {
        let queue: FixedTaskQueue<i32> = FixedTaskQueue::new(0);
        queue.submit(|| 1);
        assert_eq!(queue.drain(), vec![1]);
    }
}
