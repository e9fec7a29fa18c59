// MIT License
//
// Copyright (c) 2020 Gregory Meyer
//
// Permission is hereby granted, free of charge, to any person
// obtaining a copy of this software and associated documentation files
// (the "Software"), to deal in the Software without restriction,
// including without limitation the rights to use, copy, modify, merge,
// publish, distribute, sublicense, and/or sell copies of the Software,
// and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:
//
// The above copyright notice and this permission notice shall be
// included in all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND,
// EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF
// MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS
// BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN
// ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Exponential backoff for contended compare-and-swap loops.

use std::{hint, thread, time::Duration};

const LOOPS_BEFORE_SLEEP: usize = 4;
const LOOPS_BEFORE_YIELD: usize = 16;

/// Helper to spread out retries of a contended atomic operation.
///
/// Each call to [`pause`] escalates through three regimes: the first few
/// calls busy-spin, the next few sleep for a nanosecond, and every call
/// after that yields the thread. [`reset`] returns to the spinning regime
/// once the contended operation has succeeded.
///
/// [`pause`]: #method.pause
/// [`reset`]: #method.reset
#[derive(Debug, Default)]
pub struct Backoff {
    counter: usize,
}

impl Backoff {
    /// Creates a new `Backoff` in the busy-spinning regime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits before the next retry, escalating from spinning through
    /// sleeping to yielding as calls accumulate.
    pub fn pause(&mut self) {
        if self.counter < LOOPS_BEFORE_SLEEP {
            self.counter += 1;
            hint::spin_loop();

            return;
        }

        if self.counter < LOOPS_BEFORE_YIELD {
            self.counter += 1;
            thread::sleep(Duration::from_nanos(1));

            return;
        }

        thread::yield_now();
    }

    /// Returns to the busy-spinning regime.
    pub fn reset(&mut self) {
        self.counter = 0;
    }
}
