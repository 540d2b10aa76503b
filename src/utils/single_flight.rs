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

//! Keyed request coalescing.
//!
//! The first caller for a key spawns the work on the runtime; everyone who
//! asks for the same key while it runs gets a [`Flight`] on the same result.
//! The work is detached from its callers: a caller giving up (dropping its
//! `Flight`, e.g. on timeout) never cancels it, and the result still reaches
//! whoever is waiting.

use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::trace;

#[derive(Debug)]
pub struct SingleFlight<K, V>
where
    K: Eq + Hash,
{
    calls: DashMap<K, watch::Receiver<Option<V>>>,
}

/// Handle on one in-flight call.
#[derive(Debug)]
pub struct Flight<V> {
    receiver: watch::Receiver<Option<V>>,
    leader: bool,
}

impl<V: Clone> Flight<V> {
    /// Whether this caller started the work.
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// The call's result, or `None` if the work died without producing one.
    pub async fn wait(mut self) -> Option<V> {
        match self.receiver.wait_for(|value| value.is_some()).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        }
    }
}

// Removes the key even if the work panics, so the next caller starts over.
struct CallGuard<K, V>
where
    K: Eq + Hash,
{
    flights: Arc<SingleFlight<K, V>>,
    key: K,
}

impl<K: Eq + Hash, V> Drop for CallGuard<K, V> {
    fn drop(&mut self) {
        self.flights.calls.remove(&self.key);
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Joins the call running for `key`, or starts `work` if there is none.
    /// `work` is only invoked by the caller that starts the call.
    pub fn join<F, Fut>(self: &Arc<Self>, key: K, work: F) -> Flight<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (receiver, sender) = match self.calls.entry(key.clone()) {
            Entry::Occupied(entry) => {
                trace!("join in-flight call for {:?}", key);
                (entry.get().clone(), None)
            }
            Entry::Vacant(entry) => {
                let (sender, receiver) = watch::channel(None);
                entry.insert(receiver.clone());
                (receiver, Some(sender))
            }
        };

        let Some(sender) = sender else {
            return Flight {
                receiver,
                leader: false,
            };
        };

        trace!("start call for {:?}", key);
        let guard = CallGuard {
            flights: Arc::clone(self),
            key,
        };
        let future = work();
        tokio::spawn(async move {
            let value = future.await;
            // unregister before publishing: a caller arriving now starts fresh
            drop(guard);
            let _ = sender.send(Some(value));
        });

        Flight {
            receiver,
            leader: true,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.calls.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_call() {
        let flights: Arc<SingleFlight<&'static str, u64>> = SingleFlight::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = {
            let calls = calls.clone();
            flights.join("k", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = release_rx.await;
                42
            })
        };
        assert!(first.is_leader());

        let mut followers = Vec::new();
        for _ in 0..10 {
            let calls = calls.clone();
            let flight = flights.join("k", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                0
            });
            assert!(!flight.is_leader());
            followers.push(tokio::spawn(flight.wait()));
        }
        assert_eq!(flights.in_flight(), 1);

        release_tx.send(()).unwrap();
        assert_eq!(first.wait().await, Some(42));
        for follower in followers {
            assert_eq!(follower.await.unwrap(), Some(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!flights.is_in_flight(&"k"));
    }

    #[tokio::test]
    async fn test_new_call_after_completion() {
        let flights: Arc<SingleFlight<i32, i32>> = SingleFlight::new();
        assert_eq!(flights.join(1, || async { 1 }).wait().await, Some(1));
        assert_eq!(flights.join(1, || async { 2 }).wait().await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_waiter_does_not_cancel_work() {
        let flights: Arc<SingleFlight<i32, i32>> = SingleFlight::new();
        let done = Arc::new(AtomicUsize::new(0));
        let flight = {
            let done = done.clone();
            flights.join(7, move || async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
                7
            })
        };
        let waited = tokio::time::timeout(Duration::from_secs(1), flight.wait()).await;
        assert!(waited.is_err());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!flights.is_in_flight(&7));
    }

    #[tokio::test]
    async fn test_panicking_work_releases_key() {
        let flights: Arc<SingleFlight<i32, i32>> = SingleFlight::new();
        let flight = flights.join(3, || async { panic!("lookup exploded") });
        assert_eq!(flight.wait().await, None);
        assert!(!flights.is_in_flight(&3));
        assert_eq!(flights.join(3, || async { 3 }).wait().await, Some(3));
    }
}
