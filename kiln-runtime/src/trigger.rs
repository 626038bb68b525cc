//! Index of keys waiting for other objects to change
use ahash::AHashMap;
use parking_lot::Mutex;

/// Maps the key of a blocking object to the keys of the objects waiting on it
///
/// Used to re-queue builds whose image references could not be resolved once the
/// image stream they reference changes.
#[derive(Debug, Default)]
pub struct ResourceTriggerQueue {
    queue: Mutex<AHashMap<String, Vec<String>>>,
}

impl ResourceTriggerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `resource` as waiting on each key in `on`
    pub fn add(&self, resource: &str, on: &[String]) {
        let mut queue = self.queue.lock();
        for key in on {
            let waiting = queue.entry(key.clone()).or_default();
            if !waiting.iter().any(|r| r == resource) {
                waiting.push(resource.to_owned());
            }
        }
    }

    /// Unregisters `resource` from each key in `on`
    pub fn remove(&self, resource: &str, on: &[String]) {
        let mut queue = self.queue.lock();
        for key in on {
            if let Some(waiting) = queue.get_mut(key) {
                waiting.retain(|r| r != resource);
                if waiting.is_empty() {
                    queue.remove(key);
                }
            }
        }
    }

    /// Takes every resource waiting on `key`
    pub fn pop(&self, key: &str) -> Vec<String> {
        self.queue.lock().remove(key).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn add_and_pop() {
        let q = ResourceTriggerQueue::new();
        q.add("app/ruby-1", &keys(&["app/ruby", "app/base"]));
        q.add("app/ruby-2", &keys(&["app/ruby"]));
        q.add("app/ruby-2", &keys(&["app/ruby"]));

        assert_eq!(q.pop("app/ruby"), keys(&["app/ruby-1", "app/ruby-2"]));
        assert!(q.pop("app/ruby").is_empty());
        assert_eq!(q.pop("app/base"), keys(&["app/ruby-1"]));
        assert!(q.is_empty());
    }

    #[test]
    fn remove_unregisters() {
        let q = ResourceTriggerQueue::new();
        q.add("app/ruby-1", &keys(&["app/ruby"]));
        q.add("app/ruby-2", &keys(&["app/ruby"]));
        q.remove("app/ruby-1", &keys(&["app/ruby", "app/missing"]));
        assert_eq!(q.pop("app/ruby"), keys(&["app/ruby-2"]));

        q.add("app/ruby-3", &keys(&["app/base"]));
        q.remove("app/ruby-3", &keys(&["app/base"]));
        assert!(q.is_empty());
    }

    #[test]
    fn concurrent_access() {
        let q = std::sync::Arc::new(ResourceTriggerQueue::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let q = q.clone();
                std::thread::spawn(move || q.add(&format!("app/b-{i}"), &["app/stream".to_string()]))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(q.pop("app/stream").len(), 8);
    }
}
