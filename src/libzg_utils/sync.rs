// Copyright 2020 Zero Go Authors
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

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

/// A thread-safe counter that threads can block on until it reaches some
/// expected value.
pub struct Counter {
    count: Mutex<usize>,
    cond: Condvar
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

impl Counter {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cond: Condvar::new()
        }
    }

    /// Increment the counter and wake every blocked waiter.
    pub fn increment(&self) -> usize {
        let mut count = self.count.lock().expect("could not acquire counter lock");
        *count += 1;
        self.cond.notify_all();
        *count
    }

    pub fn get(&self) -> usize {
        *self.count.lock().expect("could not acquire counter lock")
    }

    pub fn reset(&self) {
        let mut count = self.count.lock().expect("could not acquire counter lock");
        *count = 0;
        self.cond.notify_all();
    }

    /// Block until the counter reaches at least `expected`.
    ///
    /// # Arguments
    ///
    /// * `expected` -
    ///
    pub fn wait_until(&self, expected: usize) {
        let mut count = self.count.lock().expect("could not acquire counter lock");

        while *count < expected {
            count = self.cond.wait(count).expect("could not wait on counter");
        }
    }
}

/// A one-way shutdown flag combined with a counter of parties that have
/// acknowledged it.
pub struct Notif {
    flag: AtomicBool,
    counter: Counter
}

impl Default for Notif {
    fn default() -> Self {
        Self::new()
    }
}

impl Notif {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            counter: Counter::new()
        }
    }

    pub fn get(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Acknowledge the notification from a worker.
    pub fn notify(&self) {
        self.counter.increment();
    }

    /// Raise the flag and block until `n` workers have acknowledged it.
    ///
    /// # Arguments
    ///
    /// * `n` -
    ///
    pub fn wait(&self, n: usize) {
        self.set();
        self.counter.wait_until(n);
    }
}

/// An `f32` that can be shared between threads, stored as its raw bits.
/// Reads and writes are atomic but not synchronizing, so this is only
/// suitable for monotonically refined statistics.
pub struct AtomicF32 {
    bits: AtomicU32
}

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self { bits: AtomicU32::new(value.to_bits()) }
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: f32) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }
}
