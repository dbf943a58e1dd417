use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use config::CoordinationConfig;
use parking_lot::Mutex;
use zk_coordination::{
    CacheHandler, CoordinationError, Coordinator, MemoryClient, MemoryEnsemble, RetryPolicy,
};

fn config(service_id: &str) -> CoordinationConfig {
    let mut cfg = CoordinationConfig::parse_str(
        r#"{
            "hosts": "memory:2181",
            "region": "ISD1",
            "cluster": "AD10",
            "service_type": "bs",
            "service_id": "unset",
            "lock_timeout_ms": 100,
            "cache_poll_interval_ms": 20,
            "retry": {"max_retries": 4, "connect_timeout_ms": 100}
        }"#,
    )
    .unwrap();
    cfg.service_id = service_id.to_owned();
    cfg
}

async fn start(ensemble: &MemoryEnsemble, service_id: &str) -> (MemoryClient, Coordinator) {
    let client = ensemble.client();
    let coordinator = Coordinator::builder(config(service_id), Arc::new(client.clone()))
        .start()
        .await
        .unwrap();
    assert!(coordinator.wait_connected(Some(Duration::from_secs(1))).await);
    (client, coordinator)
}

/// Poll `cond` until it holds, failing the test after a while.
async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[derive(Default)]
struct Recorder {
    batches: Mutex<Vec<Vec<Vec<u8>>>>,
}

#[async_trait]
impl CacheHandler for Recorder {
    async fn handle(&self, _path: &str, entries: Vec<Vec<u8>>) {
        self.batches.lock().push(entries);
    }
}

impl Recorder {
    fn len(&self) -> usize {
        self.batches.lock().len()
    }

    fn delivered(&self) -> Vec<Vec<u8>> {
        let mut all: Vec<_> = self.batches.lock().iter().flatten().cloned().collect();
        all.sort();
        all
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_sets_up_namespace_and_hooks() {
    let ensemble = MemoryEnsemble::new();
    let connects = Arc::new(AtomicUsize::new(0));
    let disconnects = Arc::new(AtomicUsize::new(0));
    let client = ensemble.client();
    let coordinator = {
        let connects = connects.clone();
        let disconnects = disconnects.clone();
        Coordinator::builder(config("bs1"), Arc::new(client.clone()))
            .on_connect(move || {
                connects.fetch_add(1, Ordering::SeqCst);
            })
            .on_disconnect(move || {
                disconnects.fetch_add(1, Ordering::SeqCst);
            })
            .shared_cache("shared", Arc::new(Recorder::default()))
            .start()
            .await
            .unwrap()
    };
    assert!(coordinator.wait_connected(Some(Duration::from_secs(1))).await);
    assert_eq!(coordinator.namespace().prefix(), "/ISD1-AD10/bs");
    assert!(ensemble.contains("/ISD1-AD10/bs"));
    assert!(ensemble.contains("/ISD1-AD10/bs/shared"));
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    client.suspend();
    eventually("disconnect", || !coordinator.is_connected()).await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert!(client.reconnect());
    assert!(coordinator.wait_connected(Some(Duration::from_secs(1))).await);
    assert_eq!(connects.load(Ordering::SeqCst), 2);

    assert!(coordinator.state_worker().is_some());
    assert!(coordinator.state_worker().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_startup_timeout() {
    let ensemble = MemoryEnsemble::new();
    ensemble.set_online(false);
    let result = Coordinator::builder(config("bs1"), Arc::new(ensemble.client()))
        .start()
        .await;
    assert!(matches!(
        result,
        Err(CoordinationError::StartupTimeout(t)) if t == Duration::from_secs(1)
    ));
}

#[tokio::test]
async fn test_invalid_cache_registration() {
    let ensemble = MemoryEnsemble::new();
    let result = Coordinator::builder(config("bs1"), Arc::new(ensemble.client()))
        .shared_cache("shared", Arc::new(Recorder::default()))
        .shared_cache("shared", Arc::new(Recorder::default()))
        .start()
        .await;
    assert!(matches!(result, Err(CoordinationError::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn test_lock_dropped_on_suspend() {
    let ensemble = MemoryEnsemble::new();
    let (client, coordinator) = start(&ensemble, "bs1").await;

    assert!(coordinator.get_lock().await.unwrap());
    assert!(coordinator.have_lock());

    client.suspend();
    eventually("disconnect", || !coordinator.is_connected()).await;
    assert!(!coordinator.have_lock());

    assert!(client.reconnect());
    assert!(coordinator.wait_connected(Some(Duration::from_secs(1))).await);
    // still not held until a fresh acquire succeeds
    assert!(!coordinator.have_lock());
    assert!(coordinator.get_lock().await.unwrap());
    assert!(coordinator.have_lock());
}

#[tokio::test(start_paused = true)]
async fn test_lock_handed_over_after_session_loss() {
    let ensemble = MemoryEnsemble::new();
    let (client_a, a) = start(&ensemble, "bs1").await;
    let (_client_b, b) = start(&ensemble, "bs2").await;

    assert!(a.get_lock().await.unwrap());
    assert!(!b.get_lock().await.unwrap());

    client_a.expire_session();
    eventually("session loss", || !a.is_connected()).await;
    assert!(!a.have_lock());
    assert!(b.get_lock_within(Some(Duration::from_millis(100))).await.unwrap());

    assert!(client_a.reconnect());
    assert!(a.wait_connected(Some(Duration::from_secs(1))).await);
    assert!(!a.get_lock().await.unwrap());
    assert!(b.have_lock());

    b.release_lock().await.unwrap();
    assert!(!b.have_lock());
    assert!(a.get_lock().await.unwrap());
}

#[tokio::test]
async fn test_wait_lock() {
    let ensemble = MemoryEnsemble::new();
    let (_client, coordinator) = start(&ensemble, "bs1").await;
    let waiter = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.wait_lock().await })
    };
    assert!(coordinator.get_lock().await.unwrap());
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_store_overwrites_and_concurrent_store() {
    let ensemble = MemoryEnsemble::new();
    let (_a_client, a) = start(&ensemble, "bs1").await;
    let (_b_client, b) = start(&ensemble, "bs2").await;
    a.ensure_path("shared").await.unwrap();

    a.store_shared_item("shared", "item01", b"v1").await.unwrap();
    a.store_shared_item("shared", "item01", b"v2").await.unwrap();
    assert_eq!(b.get_shared_item("shared", "item01").await.unwrap(), b"v2");

    let (ra, rb) = tokio::join!(
        a.store_shared_item("shared", "fresh", b"a"),
        b.store_shared_item("shared", "fresh", b"b"),
    );
    ra.unwrap();
    rb.unwrap();
    let value = a.get_shared_item("shared", "fresh").await.unwrap();
    assert!(value == b"a" || value == b"b");

    assert!(matches!(
        a.get_shared_item("shared", "missing").await,
        Err(CoordinationError::NoNode(_))
    ));
}

#[tokio::test]
async fn test_expire_shared_items() {
    let ensemble = MemoryEnsemble::new();
    ensemble.set_clock(100_000);
    let (_client, coordinator) = start(&ensemble, "bs1").await;
    coordinator.ensure_path("shared").await.unwrap();

    for name in ["a", "b", "c"] {
        coordinator
            .store_shared_item("shared", name, name.as_bytes())
            .await
            .unwrap();
    }
    ensemble.advance_clock(Duration::from_secs(10));
    coordinator
        .store_shared_item("shared", "d", b"d")
        .await
        .unwrap();

    let removed = coordinator
        .expire_shared_items("shared", ensemble.now() - 5_000)
        .await
        .unwrap();
    assert_eq!(removed, 3);
    let remaining = coordinator.get_shared_metadata("shared").await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name, "d");
    assert_eq!(remaining[0].last_modified, 110_000);
}

#[tokio::test(start_paused = true)]
async fn test_cache_resync_after_session_loss() {
    let ensemble = MemoryEnsemble::new();
    ensemble.set_clock(1_000);
    let recorder = Arc::new(Recorder::default());
    let client = ensemble.client();
    let coordinator = Coordinator::builder(config("bs1"), Arc::new(client.clone()))
        .shared_cache("shared", recorder.clone())
        .start()
        .await
        .unwrap();
    assert!(coordinator.wait_connected(Some(Duration::from_secs(1))).await);
    let workers = coordinator.run_shared_cache_handling();
    assert_eq!(workers.len(), 1);
    assert!(coordinator.run_shared_cache_handling().is_empty());

    coordinator
        .store_shared_item("shared", "one", b"1")
        .await
        .unwrap();
    ensemble.advance_clock(Duration::from_millis(1));
    coordinator
        .store_shared_item("shared", "two", b"2")
        .await
        .unwrap();
    let cache = coordinator.shared_caches()[0].clone();
    eventually("first delivery", || recorder.delivered().len() == 2).await;
    assert!(cache.wait_synced(Some(Duration::from_secs(1))).await);

    // nothing new: nothing delivered
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(recorder.delivered().len(), 2);

    client.expire_session();
    eventually("sync lost", || !cache.is_synced()).await;
    assert!(client.reconnect());
    assert!(coordinator.wait_connected(Some(Duration::from_secs(1))).await);
    assert!(cache.wait_synced(Some(Duration::from_secs(1))).await);
    eventually("redelivery", || recorder.delivered().len() == 4).await;

    // every still-present entry exactly once more
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        recorder.delivered(),
        vec![b"1".to_vec(), b"1".to_vec(), b"2".to_vec(), b"2".to_vec()]
    );
    assert!(recorder.len() >= 2);

    for worker in workers {
        worker.abort();
    }
}

#[tokio::test(start_paused = true)]
async fn test_party_rejoined_after_session_loss() {
    let ensemble = MemoryEnsemble::new();
    let (client_a, a) = start(&ensemble, "bs1").await;
    let (_client_b, b) = start(&ensemble, "bs2").await;

    let party_a = a.party_setup(None, true).await.unwrap();
    assert_eq!(party_a.path(), "/ISD1-AD10/bs/party");
    let again = a.party_setup(None, true).await.unwrap();
    assert!(Arc::ptr_eq(&party_a, &again));
    assert_eq!(a.parties().len(), 1);

    let observer = b.party_setup(None, false).await.unwrap();
    let members = observer.list().await.unwrap();
    assert_eq!(members.len(), 1);
    assert!(members.contains("bs1"));

    client_a.expire_session();
    eventually("session loss", || !a.is_connected()).await;
    assert!(observer.list().await.unwrap().is_empty());
    assert!(matches!(
        a.party_setup(Some("/ISD1-AD10"), true).await,
        Err(CoordinationError::ConnectionLoss)
    ));

    assert!(client_a.reconnect());
    assert!(a.wait_connected(Some(Duration::from_secs(1))).await);
    assert!(observer.list().await.unwrap().contains("bs1"));
}

#[tokio::test(start_paused = true)]
async fn test_retry_through_outage() {
    let ensemble = MemoryEnsemble::new();
    let (client, coordinator) = start(&ensemble, "bs1").await;
    coordinator.ensure_path("shared").await.unwrap();

    client.suspend();
    eventually("disconnect", || !coordinator.is_connected()).await;
    {
        let client = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            client.reconnect();
        });
    }
    coordinator
        .retry("storing item", || {
            coordinator.store_shared_item("shared", "item", b"x")
        })
        .await
        .unwrap();
    assert_eq!(ensemble.data("/ISD1-AD10/bs/shared/item").unwrap(), b"x");

    client.suspend();
    eventually("disconnect", || !coordinator.is_connected()).await;
    let policy = RetryPolicy {
        max_retries: Some(1),
        connect_timeout: Some(Duration::from_millis(10)),
    };
    let result = coordinator
        .retry_with("storing item", policy, || {
            coordinator.store_shared_item("shared", "item", b"y")
        })
        .await;
    assert!(matches!(
        result,
        Err(CoordinationError::RetryLimitExceeded { attempts: 2, .. })
    ));
}
