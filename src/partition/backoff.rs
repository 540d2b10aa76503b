// Copyright 2025 jonefeewang@gmail.com
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

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;

/// Time source for the retry schedule.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Instant;
}

/// Tokio's clock, so paused test runtimes drive it too.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    elapsed: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            base: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.elapsed.lock()
    }
}

/// Retry schedule for partition lookups.
///
/// Delays start at `initial` and double up to `max`. Once the time spent
/// since the first delay plus the next delay would pass `mandatory_stop`,
/// that delay is shortened to land on the deadline and it is the last one.
/// `max_attempts` caps the number of delays regardless of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub mandatory_stop: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            mandatory_stop: Duration::from_secs(10),
            max_attempts: 10,
        }
    }
}

#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    clock: Arc<dyn Clock>,
    next: Duration,
    first_backoff_at: Option<Instant>,
    mandatory_stop_made: bool,
    attempts: u32,
    jitter: bool,
}

impl Backoff {
    pub fn new(config: BackoffConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            next: config.initial,
            first_backoff_at: None,
            mandatory_stop_made: false,
            attempts: 0,
            jitter: true,
        }
    }

    /// Deterministic delays, for tests.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the next retry, `None` once the budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.mandatory_stop_made || self.attempts >= self.config.max_attempts {
            return None;
        }
        self.attempts += 1;

        let mut current = self.next;
        if current < self.config.max {
            self.next = (self.next * 2).min(self.config.max);
        }

        let now = self.clock.now();
        let elapsed = match self.first_backoff_at {
            Some(first) => now.saturating_duration_since(first),
            None => {
                self.first_backoff_at = Some(now);
                Duration::ZERO
            }
        };
        if elapsed + current > self.config.mandatory_stop {
            current = self
                .config
                .initial
                .max(self.config.mandatory_stop.saturating_sub(elapsed));
            self.mandatory_stop_made = true;
        }

        // up to 10% off
        if self.jitter && current.as_millis() > 10 {
            let max_cut = (current.as_millis() / 10) as u64;
            let cut = rand::thread_rng().gen_range(0..max_cut);
            current -= Duration::from_millis(cut);
        }

        Some(current.max(self.config.initial))
    }

    pub fn is_mandatory_stop_made(&self) -> bool {
        self.mandatory_stop_made
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.next = self.config.initial;
        self.first_backoff_at = None;
        self.mandatory_stop_made = false;
        self.attempts = 0;
    }
}
