use crate::error::{CacheError, ConfigError};
use crate::pipeline::item::ItemValue;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Execution-scoped key/value store shared by all stages.
///
/// Every element sits behind its own lock, so operations on one key are
/// linearizable and never block other keys. The key set is fixed at
/// construction.
pub struct GlobalCache {
    elements: IndexMap<String, Mutex<ItemValue>>,
    signals: Mutex<HashMap<String, Arc<Signal>>>,
}

#[derive(Default)]
struct Signal {
    raised: Mutex<bool>,
    notify: Notify,
}

impl fmt::Debug for GlobalCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.elements.iter().map(|(k, v)| (k, v.lock().clone())))
            .finish()
    }
}

impl Default for GlobalCache {
    fn default() -> Self {
        GlobalCache {
            elements: IndexMap::new(),
            signals: Mutex::new(HashMap::new()),
        }
    }
}

impl GlobalCache {
    /// Build from `Name|Literal` or `Name` (Null) entries
    pub fn from_elements<S: AsRef<str>>(elements: &[S]) -> Result<Self, ConfigError> {
        let mut cache = GlobalCache::default();
        for element in elements {
            let element = element.as_ref();
            let (name, value) = match element.split_once('|') {
                Some((name, literal)) => (name.trim(), ItemValue::infer(literal)),
                None => (element.trim(), ItemValue::Null),
            };
            if name.is_empty() {
                return Err(ConfigError::InvalidCacheElement(element.to_string()));
            }
            if cache.elements.contains_key(name) {
                return Err(ConfigError::DuplicateCacheKey(name.to_string()));
            }
            cache.elements.insert(name.to_string(), Mutex::new(value));
        }
        debug!(elements = cache.elements.len(), "Global cache created");
        Ok(cache)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.elements.keys().map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.elements.contains_key(key)
    }

    fn element(&self, key: &str) -> Result<&Mutex<ItemValue>, CacheError> {
        self.elements
            .get(key)
            .ok_or_else(|| CacheError::MissingKey(key.to_string()))
    }

    pub fn get(&self, key: &str) -> Result<ItemValue, CacheError> {
        Ok(self.element(key)?.lock().clone())
    }

    pub fn try_get(&self, key: &str) -> Option<ItemValue> {
        self.elements.get(key).map(|v| v.lock().clone())
    }

    /// Atomically add `delta` to an Int element; returns the new value
    pub fn increment_value(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let mut value = self.element(key)?.lock();
        match &*value {
            ItemValue::Int(current) => {
                let next = current
                    .checked_add(delta)
                    .ok_or_else(|| CacheError::Overflow(key.to_string()))?;
                *value = ItemValue::Int(next);
                Ok(next)
            }
            other => Err(CacheError::NotAnInt {
                key: key.to_string(),
                actual: other.type_name(),
            }),
        }
    }

    /// Compare-and-swap: store `new` only if the element still equals `expected`
    pub fn try_replace(
        &self,
        key: &str,
        new: ItemValue,
        expected: &ItemValue,
    ) -> Result<bool, CacheError> {
        let mut value = self.element(key)?.lock();
        if *value == *expected {
            *value = new;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Read, transform and compare-and-swap until the swap succeeds.
    /// Returns the number of attempts. `f` may run more than once.
    pub fn replace_value(
        &self,
        key: &str,
        f: impl Fn(&ItemValue) -> ItemValue,
    ) -> Result<usize, CacheError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let current = self.get(key)?;
            let next = f(&current);
            if self.try_replace(key, next, &current)? {
                return Ok(attempts);
            }
        }
    }

    fn signal(&self, name: &str) -> Arc<Signal> {
        self.signals.lock().entry(name.to_string()).or_default().clone()
    }

    /// Raise a one-shot signal, waking every waiter
    pub fn raise_signal(&self, name: &str) {
        let signal = self.signal(name);
        *signal.raised.lock() = true;
        signal.notify.notify_waiters();
    }

    pub fn is_signal_raised(&self, name: &str) -> bool {
        self.signals
            .lock()
            .get(name)
            .map(|s| *s.raised.lock())
            .unwrap_or(false)
    }

    /// Wait until the signal is raised; returns at once if it already was
    pub async fn await_signal(&self, name: &str) {
        let signal = self.signal(name);
        loop {
            let notified = signal.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if *signal.raised.lock() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_seed_type_inference() {
        let cache = GlobalCache::from_elements(&[
            "I1|0",
            "D1|2.5",
            "B1|true",
            "S1|\"123\"",
            "S2| abc",
            "T1|2021-06-01",
            "N1",
        ])
        .unwrap();

        assert_eq!(cache.get("I1").unwrap(), ItemValue::Int(0));
        assert_eq!(cache.get("D1").unwrap(), ItemValue::Decimal(2.5));
        assert_eq!(cache.get("B1").unwrap(), ItemValue::Bool(true));
        assert_eq!(cache.get("S1").unwrap(), ItemValue::String("123".into()));
        assert_eq!(cache.get("S2").unwrap(), ItemValue::String("abc".into()));
        let expected = NaiveDate::from_ymd_opt(2021, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(cache.get("T1").unwrap(), ItemValue::DateTime(expected));
        assert_eq!(cache.get("N1").unwrap(), ItemValue::Null);
    }

    #[test]
    fn test_missing_key_is_named() {
        let cache = GlobalCache::from_elements(&["A|1"]).unwrap();
        let err = cache.get("B").unwrap_err();
        assert_eq!(err, CacheError::MissingKey("B".into()));
        assert!(err.to_string().contains("'B'"));
        assert_eq!(cache.try_get("B"), None);
    }

    #[test]
    fn test_invalid_seeds() {
        assert!(matches!(
            GlobalCache::from_elements(&["A|1", "A|2"]),
            Err(ConfigError::DuplicateCacheKey(_))
        ));
        assert!(matches!(
            GlobalCache::from_elements(&["|1"]),
            Err(ConfigError::InvalidCacheElement(_))
        ));
    }

    #[test]
    fn test_increment_requires_int() {
        let cache = GlobalCache::from_elements(&["S|abc", "I|1"]).unwrap();
        assert!(matches!(
            cache.increment_value("S", 1),
            Err(CacheError::NotAnInt { .. })
        ));
        assert_eq!(cache.increment_value("I", 4).unwrap(), 5);
    }

    #[test]
    fn test_compare_and_swap() {
        let cache = GlobalCache::from_elements(&["S|abc"]).unwrap();
        assert!(!cache
            .try_replace("S", "x".into(), &ItemValue::from("zzz"))
            .unwrap());
        assert!(cache
            .try_replace("S", "x".into(), &ItemValue::from("abc"))
            .unwrap());
        assert_eq!(cache.get("S").unwrap(), ItemValue::from("x"));
    }

    #[test]
    fn test_replace_value_uncontended() {
        let cache = GlobalCache::from_elements(&["S|abc"]).unwrap();
        let attempts = cache
            .replace_value("S", |v| ItemValue::from(format!("{}!", v)))
            .unwrap();
        assert_eq!(attempts, 1);
        assert_eq!(cache.get("S").unwrap(), ItemValue::from("abc!"));
    }

    #[tokio::test]
    async fn test_await_signal() {
        let cache = Arc::new(GlobalCache::default());
        assert!(!cache.is_signal_raised("go"));

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.await_signal("go").await })
        };
        tokio::task::yield_now().await;
        cache.raise_signal("go");
        waiter.await.unwrap();

        assert!(cache.is_signal_raised("go"));
        // already raised: returns immediately
        cache.await_signal("go").await;
    }
}
