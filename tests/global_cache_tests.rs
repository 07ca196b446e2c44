// tests/global_cache_tests.rs
use linewright::{CacheError, GlobalCache, ItemValue};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_are_not_lost() {
    let cache = Arc::new(GlobalCache::from_elements(&["I1|0"]).unwrap());

    let mut tasks = Vec::new();
    for (count, delta) in [(10000, 1), (8000, 2), (5001, -3)] {
        let cache = cache.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            for _ in 0..count {
                cache.increment_value("I1", delta).unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(cache.get("I1").unwrap(), ItemValue::Int(10997));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replace_value_under_contention() {
    let cache = Arc::new(GlobalCache::from_elements(&["Names|\"\""]).unwrap());

    let mut tasks = Vec::new();
    for worker in 0..4 {
        let cache = cache.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            let mut attempts = 0;
            for _ in 0..250 {
                attempts += cache
                    .replace_value("Names", |current| {
                        let text = current.as_str().unwrap_or_default();
                        ItemValue::String(format!("{}{}", text, worker))
                    })
                    .unwrap();
            }
            attempts
        }));
    }
    let mut attempts = 0;
    for task in tasks {
        attempts += task.await.unwrap();
    }

    let names = cache.get("Names").unwrap();
    assert_eq!(names.as_str().map(str::len), Some(1000));
    assert!(attempts >= 1000);
}

#[test]
fn test_cache_errors() {
    let cache = GlobalCache::from_elements(&["S1|abc"]).unwrap();

    assert!(matches!(cache.get("Missing"), Err(CacheError::MissingKey(_))));
    assert!(matches!(
        cache.increment_value("S1", 1),
        Err(CacheError::NotAnInt { .. })
    ));
    assert!(cache.try_get("Missing").is_none());
    assert!(GlobalCache::from_elements(&["A|1", "A|2"]).is_err());
}

#[tokio::test]
async fn test_signal_wakes_waiters() {
    let cache = Arc::new(GlobalCache::default());

    let waiter = tokio::spawn({
        let cache = cache.clone();
        async move { cache.await_signal("Ready").await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());
    assert!(!cache.is_signal_raised("Ready"));

    cache.raise_signal("Ready");
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter woke up")
        .unwrap();
    assert!(cache.is_signal_raised("Ready"));
    // a raised signal stays raised
    cache.await_signal("Ready").await;
}
