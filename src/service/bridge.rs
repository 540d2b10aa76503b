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

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{info, trace};

use crate::offset::OffsetManager;
use crate::partition::PartitionCache;
use crate::storage::{StorageSubsystem, SubscriptionRegistry};
use crate::{AppResult, BridgeConfig};

/// Process-scoped owner of the offset bridge state. Request handlers reach
/// the offset table through [`Bridge::manager`]; [`Bridge::run`] drives the
/// background passes until shutdown.
#[derive(Debug)]
pub struct Bridge {
    config: BridgeConfig,
    manager: Arc<OffsetManager>,
}

impl Bridge {
    pub fn new(
        config: BridgeConfig,
        storage: Arc<dyn StorageSubsystem>,
        subscriptions: Arc<dyn SubscriptionRegistry>,
    ) -> Self {
        let cache = Arc::new(PartitionCache::new(
            storage,
            config.resolution.backoff(),
            config.resolution.caller_wait(),
        ));
        let manager = Arc::new(OffsetManager::new(
            cache,
            subscriptions,
            config.general.system_group_prefixes.clone(),
        ));
        Bridge { config, manager }
    }

    pub fn manager(&self) -> &Arc<OffsetManager> {
        &self.manager
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Runs the sweep and persist tasks until `shutdown_signal` resolves,
    /// then waits for both to finish, the final persist pass included.
    pub async fn run(&self, shutdown_signal: impl Future<Output = ()>) -> AppResult<()> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        let sweep_interval = Duration::from_secs(self.config.sweeper.interval_secs);
        let persist_interval = match self.config.persist.interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        self.manager.start_tasks(
            sweep_interval,
            persist_interval,
            &notify_shutdown,
            &shutdown_complete_tx,
        );
        drop(shutdown_complete_tx);
        info!(
            "offset bridge {} started, sweep every {}s",
            self.config.general.id, self.config.sweeper.interval_secs
        );

        shutdown_signal.await;
        info!("get shutdown signal");
        // tasks already gone when the send fails; nothing left to notify
        let _ = notify_shutdown.send(());

        trace!("waiting for shutdown complete...");
        shutdown_complete_rx.recv().await;
        info!("offset bridge shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset::codec::encode;
    use crate::offset::PhysicalPosition;
    use crate::storage::{CursorHandle, LocalStorage, LocalSubscriptions};

    #[tokio::test(start_paused = true)]
    async fn test_run_persists_on_shutdown() {
        let storage = Arc::new(LocalStorage::new("owner-1"));
        let partition = storage.create_partition("t1", 0);
        let bridge = Bridge::new(
            BridgeConfig::default(),
            storage.clone(),
            Arc::new(LocalSubscriptions::new()),
        );

        let position = PhysicalPosition::new(0, 3);
        bridge
            .manager()
            .commit("g1", "t1", 0, encode(position).unwrap());

        let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();
        let bridge = Arc::new(bridge);
        let running = {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .run(async {
                        let _ = signal_rx.await;
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        signal_tx.send(()).unwrap();
        running.await.unwrap().unwrap();

        assert_eq!(partition.cursor("g1").unwrap().read_position(), position);
    }
}
