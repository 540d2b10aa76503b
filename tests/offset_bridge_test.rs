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

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use offset_bridge::offset::codec::{decode, encode};
use offset_bridge::storage::{CursorHandle, LocalStorage, LocalSubscriptions};
use offset_bridge::{
    setup_local_tracing, AppError, Bridge, BridgeConfig, GroupTopicKey, PhysicalPosition,
};
use rstest::{fixture, rstest};

#[fixture]
#[once]
fn setup() {
    setup_local_tracing().expect("failed to setup tracing");
}

fn bridge_over(storage: Arc<LocalStorage>) -> (Bridge, Arc<LocalSubscriptions>) {
    let subscriptions = Arc::new(LocalSubscriptions::new());
    let bridge = Bridge::new(BridgeConfig::default(), storage, subscriptions.clone());
    (bridge, subscriptions)
}

#[rstest]
fn test_commit_query_and_clone_group(_setup: ()) {
    let (bridge, _) = bridge_over(Arc::new(LocalStorage::new("owner-1")));
    let manager = bridge.manager();

    manager.commit("g1", "t1", 0, 100);
    manager.commit("g1", "t1", 1, 200);
    assert_eq!(manager.query_all("g1", "t1"), HashMap::from([(0, 100), (1, 200)]));

    manager.clone_group("g1", "g2", "t1");
    assert_eq!(manager.query_all("g2", "t1"), HashMap::from([(0, 100), (1, 200)]));
    assert_eq!(
        manager.list_groups_for_topic("t1").into_iter().collect::<Vec<_>>(),
        vec!["g1".to_string(), "g2".to_string()]
    );
}

#[rstest]
fn test_commit_regression_is_applied_and_counted(_setup: ()) {
    let (bridge, _) = bridge_over(Arc::new(LocalStorage::new("owner-1")));
    let manager = bridge.manager();

    manager.commit("g1", "t1", 0, 5);
    manager.commit("g1", "t1", 0, 5);
    assert_eq!(manager.query("g1", "t1", 0), Some(5));
    assert_eq!(manager.table().regressions(), 0);

    manager.commit("g1", "t1", 0, 3);
    assert_eq!(manager.query("g1", "t1", 0), Some(3));
    assert_eq!(manager.table().regressions(), 1);
}

#[rstest]
fn test_codec_order_follows_append_order(_setup: ()) {
    let partition = LocalStorage::new("owner-1").create_partition("t1", 0);
    let mut previous = encode(PhysicalPosition::default()).unwrap();
    for step in 0..100 {
        let position = if step % 10 == 9 {
            partition.roll_segment()
        } else {
            partition.append()
        };
        let offset = encode(position).unwrap();
        assert!(offset > previous);
        assert_eq!(decode(offset).unwrap(), position);
        previous = offset;
    }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_concurrent_resolve_issues_one_lookup(_setup: ()) {
    let storage = Arc::new(LocalStorage::new("owner-1"));
    storage.create_partition("t1", 0);
    storage.set_lookup_delay(Duration::from_millis(200));
    let (bridge, _) = bridge_over(storage.clone());
    let cache = bridge.manager().cache().clone();

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.resolve("t1", 0).await })
        })
        .collect();
    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap().unwrap());
    }

    assert_eq!(storage.lookup_count(), 1);
    assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_resolve_times_out_when_store_never_answers(_setup: ()) {
    let storage = Arc::new(LocalStorage::new("owner-1"));
    storage.create_partition("t1", 0);
    storage.set_lookup_delay(Duration::from_secs(3600));
    let (bridge, _) = bridge_over(storage.clone());
    let cache = bridge.manager().cache().clone();

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.resolve("t1", 0).await })
        })
        .collect();
    for task in tasks {
        let error = task.await.unwrap().unwrap_err();
        assert!(matches!(
            error,
            AppError::ResolutionTimeout { ref topic, partition: 0 } if topic == "t1"
        ));
        assert!(error.is_retryable());
    }

    // the abandoned flight ends on its own and a later call starts afresh
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!cache.is_resolving("t1", 0));
    storage.set_lookup_delay(Duration::ZERO);
    assert!(cache.resolve("t1", 0).await.is_ok());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_sweeper_safety(_setup: ()) {
    let storage = Arc::new(LocalStorage::new("owner-1"));
    for partition in 0..2 {
        storage
            .create_partition("t1", partition)
            .set_range(PhysicalPosition::new(10, 0), PhysicalPosition::new(20, 0));
    }
    let (bridge, subscriptions) = bridge_over(storage);
    let manager = bridge.manager();
    let below = encode(PhysicalPosition::new(8, 3)).unwrap();
    let above = encode(PhysicalPosition::new(15, 0)).unwrap();

    for group in ["active", "drained", "partial"] {
        manager.commit(group, "t1", 0, below);
        manager.commit(group, "t1", 1, below);
    }
    manager.commit("partial", "t1", 1, above);
    subscriptions.subscribe("active", "t1");

    let removed = manager.sweep().await;
    assert_eq!(removed, vec![GroupTopicKey::new("drained", "t1")]);
    assert_eq!(manager.query_all("active", "t1").len(), 2);
    assert_eq!(manager.query_all("partial", "t1").len(), 2);
    assert!(manager.query_all("drained", "t1").is_empty());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn test_persist_best_effort(_setup: ()) {
    let storage = Arc::new(LocalStorage::new("owner-1"));
    for partition in 0..3 {
        storage.create_partition("t1", partition);
    }
    storage.set_partition_unavailable("t1", 1, true);
    let (bridge, _) = bridge_over(storage.clone());
    let manager = bridge.manager();
    let position = PhysicalPosition::new(2, 40);
    for partition in 0..3 {
        manager.commit("g1", "t1", partition, encode(position).unwrap());
    }

    let report = manager.persist().await;
    assert_eq!((report.persisted, report.failed), (2, 1));
    assert!(matches!(
        report.into_result(),
        Err(AppError::PersistPartialFailure { failed: 1, total: 3 })
    ));
    for partition in [0, 2] {
        let cursor = storage.partition("t1", partition).unwrap().cursor("g1").unwrap();
        assert_eq!(cursor.read_position(), position);
    }

    // idempotent once the store is back
    storage.set_partition_unavailable("t1", 1, false);
    tokio::time::sleep(Duration::from_secs(15)).await;
    for _ in 0..2 {
        let report = manager.persist().await;
        assert_eq!((report.persisted, report.failed), (3, 0));
    }
    let cursor = storage.partition("t1", 1).unwrap().cursor("g1").unwrap();
    assert_eq!(cursor.read_position(), position);
}

#[rstest]
#[tokio::test]
async fn test_restart_restores_offsets_from_cursors(_setup: ()) {
    let temp_dir = tempfile::tempdir().unwrap();
    let checkpoint_path = temp_dir.path().join("cursor-checkpoint");
    let mut conf_file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write!(
        conf_file,
        r#"
[general]
id = 7
system_group_prefixes = ["sys/"]
cursor_checkpoint_path = "{}"

[sweeper]
interval_secs = 3600

[[storage.topics]]
name = "orders"
partitions = 2
"#,
        checkpoint_path.display()
    )
    .unwrap();
    let config = BridgeConfig::set_up_config(conf_file.path()).unwrap();
    assert_eq!(config.general.id, 7);

    let position = PhysicalPosition::new(1, 9);
    {
        let storage = Arc::new(
            LocalStorage::open("owner-1", &config.general.cursor_checkpoint_path)
                .await
                .unwrap(),
        );
        let partition = storage.create_partition("orders", 1);
        let bridge = Bridge::new(
            config.clone(),
            storage.clone(),
            Arc::new(LocalSubscriptions::new()),
        );
        bridge.manager().register_partition(partition);
        bridge
            .manager()
            .commit("billing", "orders", 1, encode(position).unwrap());
        bridge
            .manager()
            .commit("sys/audit", "orders", 1, encode(position).unwrap());

        // signal already fired: run goes straight to the final persist
        bridge.run(async {}).await.unwrap();
        storage.flush().await.unwrap();
    }

    let storage = Arc::new(
        LocalStorage::open("owner-1", &config.general.cursor_checkpoint_path)
            .await
            .unwrap(),
    );
    let partition = storage.create_partition("orders", 1);
    let (bridge, _) = bridge_over(storage.clone());
    bridge.manager().register_partition(partition);

    assert_eq!(
        bridge.manager().query("billing", "orders", 1),
        Some(encode(position).unwrap())
    );
    assert_eq!(bridge.manager().query("sys/audit", "orders", 1), None);
}
