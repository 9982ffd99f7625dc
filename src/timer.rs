// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A min-heap of per-connection idle timers, keyed by connection id.
//!
//! An arena-style binary heap over `Vec<TimerNode>` plus a `id -> heap index`
//! map kept in sync on every swap, so `adjust`/`remove` on an arbitrary id
//! stay O(log n) instead of requiring a linear scan.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A connection identifier. Conventionally the socket's slab key / fd.
pub type TimerId = usize;

/// A nullary action run when a timer fires.
pub type TimeoutCallback = Box<dyn FnMut() + Send>;

struct TimerNode {
    id: TimerId,
    expires: Instant,
    cb: TimeoutCallback,
}

/// Indexed min-heap of timers ordered by absolute expiry.
#[derive(Default)]
pub struct TimerHeap {
    heap: Vec<TimerNode>,
    ref_: HashMap<TimerId, usize>,
}

impl TimerHeap {
    /// Creates an empty heap with room for 64 timers before its first growth.
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            ref_: HashMap::with_capacity(64),
        }
    }

    /// Number of timers currently tracked.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// True if no timers are tracked.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Adds a new timer for `id`, or reschedules it with a fresh `cb` if
    /// `id` is already tracked.
    pub fn add(&mut self, id: TimerId, timeout: Duration, cb: TimeoutCallback) {
        let expires = Instant::now() + timeout;

        if let Some(&i) = self.ref_.get(&id) {
            self.heap[i].expires = expires;
            self.heap[i].cb = cb;
            self.siftdown(i);
            self.siftup(i);
            return;
        }

        let i = self.heap.len();
        self.heap.push(TimerNode { id, expires, cb });
        self.ref_.insert(id, i);
        self.siftup(i);
    }

    /// Reschedules an existing timer's expiry to `now + timeout`, keeping its
    /// callback. Returns `false` if `id` isn't tracked.
    pub fn adjust(&mut self, id: TimerId, timeout: Duration) -> bool {
        let Some(&i) = self.ref_.get(&id) else {
            return false;
        };
        self.heap[i].expires = Instant::now() + timeout;
        self.siftdown(i);
        true
    }

    /// Invokes `id`'s callback immediately, then removes the timer. Used when
    /// an external event (e.g. an early close) needs the timer's action to
    /// run out of band.
    pub fn do_work(&mut self, id: TimerId) {
        let Some(&i) = self.ref_.get(&id) else {
            return;
        };
        (self.heap[i].cb)();
        self.delete(i);
    }

    /// Removes the root timer without invoking its callback.
    pub fn pop(&mut self) {
        if !self.heap.is_empty() {
            self.delete(0);
        }
    }

    /// Removes `id`'s timer without invoking its callback, e.g. because the
    /// connection it was watching closed through some other path. Returns
    /// `false` if `id` wasn't tracked.
    pub fn remove(&mut self, id: TimerId) -> bool {
        let Some(&i) = self.ref_.get(&id) else {
            return false;
        };
        self.delete(i);
        true
    }

    /// Pops and invokes every timer whose expiry has already passed.
    pub fn tick(&mut self) {
        let now = Instant::now();
        while let Some(node) = self.heap.first() {
            if node.expires > now {
                break;
            }
            (self.heap[0].cb)();
            self.delete(0);
        }
    }

    /// Fires due timers, then returns the duration until the next one, or
    /// `None` if no timers remain (the reactor should wait indefinitely).
    pub fn get_next_tick(&mut self) -> Option<Duration> {
        self.tick();
        self.heap
            .first()
            .map(|node| node.expires.saturating_duration_since(Instant::now()))
    }

    /// Empties the heap without invoking any callbacks.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.ref_.clear();
    }

    fn delete(&mut self, i: usize) {
        let last = self.heap.len() - 1;
        self.swap(i, last);
        let removed = self.heap.pop().expect("delete called on empty heap");
        self.ref_.remove(&removed.id);

        if i < self.heap.len() {
            self.siftdown(i);
            self.siftup(i);
        }
    }

    fn siftup(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].expires <= self.heap[i].expires {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    /// Returns `true` if any swap occurred.
    fn siftdown(&mut self, mut i: usize) -> bool {
        let start = i;
        let n = self.heap.len();
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut smallest = i;

            if left < n && self.heap[left].expires < self.heap[smallest].expires {
                smallest = left;
            }
            if right < n && self.heap[right].expires < self.heap[smallest].expires {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
        i != start
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.ref_.insert(self.heap[i].id, i);
        self.ref_.insert(self.heap[j].id, j);
    }
}
