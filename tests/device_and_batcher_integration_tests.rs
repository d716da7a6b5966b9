//! Cross-component integration tests: the device manager and batcher under
//! concurrent load, exercised through the crate's public API rather than
//! each module's own internal unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use disk_orchestrator_core::batcher::Batcher;
use disk_orchestrator_core::device::DeviceManager;

#[tokio::test]
async fn concurrent_attaches_on_one_node_never_collide_on_a_path() {
    let mgr = Arc::new(DeviceManager::new());
    let mut handles = Vec::new();
    for i in 0..20 {
        let mgr = mgr.clone();
        handles.push(tokio::spawn(async move {
            mgr.new_device(
                "node-shared",
                "t3.medium",
                &format!("vol-{i}"),
                &HashMap::new(),
                &HashSet::new(),
            )
            .await
            .unwrap()
        }));
    }

    let mut paths = HashSet::new();
    for handle in handles {
        let device = handle.await.unwrap();
        assert!(paths.insert(device.path.clone()), "duplicate device path allocated under concurrency");
    }
    assert_eq!(paths.len(), 20);
}

#[tokio::test]
async fn devices_on_different_nodes_can_reuse_the_same_path() {
    let mgr = DeviceManager::new();
    let a = mgr
        .new_device("node-a", "t3.medium", "vol-a", &HashMap::new(), &HashSet::new())
        .await
        .unwrap();
    let b = mgr
        .new_device("node-b", "t3.medium", "vol-b", &HashMap::new(), &HashSet::new())
        .await
        .unwrap();
    assert_eq!(a.path, b.path, "device names are scoped per node");
}

#[tokio::test]
async fn batcher_coalesces_a_burst_of_distinct_keys_into_one_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let total_keys_seen = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    let seen2 = total_keys_seen.clone();
    let batcher: Batcher<String, i32> = Batcher::new(50, Duration::from_millis(40), move |keys| {
        let calls = calls2.clone();
        let seen = seen2.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            seen.fetch_add(keys.len(), Ordering::SeqCst);
            Ok(keys.into_iter().map(|k| (k.clone(), k.len() as i32)).collect())
        }
    });

    let mut handles = Vec::new();
    for i in 0..30 {
        let batcher = batcher.clone();
        handles.push(tokio::spawn(async move {
            batcher.get(format!("key-{i}")).await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1, "a 40ms window should coalesce a fast burst into one fire");
    assert_eq!(total_keys_seen.load(Ordering::SeqCst), 30);
}

#[tokio::test]
async fn batcher_starts_a_fresh_batch_after_the_previous_one_fires() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    let batcher: Batcher<String, i32> = Batcher::new(100, Duration::from_millis(20), move |keys| {
        let calls = calls2.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(keys.into_iter().map(|k| (k, 1)).collect())
        }
    });

    assert_eq!(batcher.get("first".to_string()).await.unwrap(), Some(1));
    assert_eq!(batcher.get("second".to_string()).await.unwrap(), Some(1));
    assert_eq!(calls.load(Ordering::SeqCst), 2, "sequential calls separated by the fire should not share a batch");
}
