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

//! Periodic passes of the offset manager.
//!
//! Both loops wait on either their interval or the shutdown broadcast. The
//! sweeper simply stops on shutdown; the persister runs one last pass so
//! that every commit accepted before shutdown reaches the store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc::Sender};
use tokio::time::Interval;
use tracing::{error, info, trace};

use crate::Shutdown;

use super::OffsetManager;

impl OffsetManager {
    pub async fn sweep_task(&self, mut interval: Interval, mut shutdown: Shutdown) {
        // the first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {trace!("sweep tick")},
                _ = shutdown.recv() => {trace!("sweep task receiving shutdown signal");}
            };
            if shutdown.is_shutdown() {
                break;
            }
            let removed = self.sweep().await;
            if !removed.is_empty() {
                info!("sweep removed {} offset entries", removed.len());
            }
        }
    }

    /// Without an interval, the only pass is the one at shutdown.
    pub async fn persist_task(&self, mut interval: Option<Interval>, mut shutdown: Shutdown) {
        if let Some(interval) = interval.as_mut() {
            interval.tick().await;
        }
        loop {
            match interval.as_mut() {
                Some(interval) => {
                    tokio::select! {
                        _ = interval.tick() => {trace!("persist tick")},
                        _ = shutdown.recv() => {trace!("persist task receiving shutdown signal");}
                    };
                }
                None => shutdown.recv().await,
            }

            let report = self.persist().await;
            if let Err(e) = report.into_result() {
                error!("persist pass incomplete: {}", e);
            }
            if shutdown.is_shutdown() {
                info!(
                    "offset manager is shutting down, final persist: {} persisted, {} failed",
                    report.persisted, report.failed
                );
                break;
            }
        }
    }

    /// Spawns the sweep and persist loops. Each holds a clone of
    /// `shutdown_complete_tx` until it returns.
    pub fn start_tasks(
        self: &Arc<Self>,
        sweep_interval: Duration,
        persist_interval: Option<Duration>,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: &Sender<()>,
    ) {
        let manager = Arc::clone(self);
        let shutdown = Shutdown::subscribe(notify_shutdown);
        let complete_tx = shutdown_complete_tx.clone();
        tokio::spawn(async move {
            manager
                .sweep_task(tokio::time::interval(sweep_interval), shutdown)
                .await;
            trace!("sweep task shutdown");
            drop(complete_tx);
        });

        let manager = Arc::clone(self);
        let shutdown = Shutdown::subscribe(notify_shutdown);
        let complete_tx = shutdown_complete_tx.clone();
        tokio::spawn(async move {
            manager
                .persist_task(persist_interval.map(tokio::time::interval), shutdown)
                .await;
            trace!("persist task shutdown");
            drop(complete_tx);
        });
    }
}
