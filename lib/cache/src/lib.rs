use std::{collections::HashMap, hash::Hash};

use tokio::sync::RwLock;

/// A `HashMap` behind an `RwLock`, cloning values out on read so callers
/// never hold the lock across an `.await`.
#[derive(Debug)]
pub struct CloneCache<K: PartialEq + Eq + Hash, T: Clone>(
  RwLock<HashMap<K, T>>,
);

impl<K: PartialEq + Eq + Hash, T: Clone> Default for CloneCache<K, T> {
  fn default() -> Self {
    Self(RwLock::new(HashMap::new()))
  }
}

impl<K: PartialEq + Eq + Hash + std::fmt::Debug + Clone, T: Clone>
  CloneCache<K, T>
{
  pub async fn get(&self, key: &K) -> Option<T> {
    self.0.read().await.get(key).cloned()
  }

  pub async fn len(&self) -> usize {
    self.0.read().await.len()
  }

  pub async fn get_keys(&self) -> Vec<K> {
    let cache = self.0.read().await;
    cache.keys().cloned().collect()
  }

  pub async fn get_values(&self) -> Vec<T> {
    let cache = self.0.read().await;
    cache.values().cloned().collect()
  }

  pub async fn get_entries(&self) -> Vec<(K, T)> {
    let cache = self.0.read().await;
    cache.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
  }

  pub async fn insert<Key>(&self, key: Key, val: T) -> Option<T>
  where
    T: std::fmt::Debug,
    Key: Into<K> + std::fmt::Debug,
  {
    self.0.write().await.insert(key.into(), val)
  }

  pub async fn remove(&self, key: &K) -> Option<T> {
    self.0.write().await.remove(key)
  }

  /// Drops every entry for which `keep` returns false.
  pub async fn retain(&self, mut keep: impl FnMut(&K, &mut T) -> bool) {
    self.0.write().await.retain(|k, v| keep(k, v));
  }
}

impl<
  K: PartialEq + Eq + Hash + std::fmt::Debug + Clone,
  T: Clone + Default,
> CloneCache<K, T>
{
  pub async fn get_or_insert_default(&self, key: &K) -> T {
    let mut lock = self.0.write().await;
    match lock.get(key).cloned() {
      Some(item) => item,
      None => {
        let item: T = Default::default();
        lock.insert(key.clone(), item.clone());
        item
      }
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[tokio::test]
  async fn insert_get_remove_roundtrip() {
    let cache = CloneCache::<String, u32>::default();
    cache.insert("a".to_string(), 1).await;
    assert_eq!(cache.get(&"a".to_string()).await, Some(1));
    assert_eq!(cache.remove(&"a".to_string()).await, Some(1));
    assert_eq!(cache.get(&"a".to_string()).await, None);
  }

  #[tokio::test]
  async fn retain_drops_stale_entries() {
    let cache = CloneCache::<String, u32>::default();
    cache.insert("keep".to_string(), 1).await;
    cache.insert("drop".to_string(), 2).await;
    cache.retain(|_, v| *v != 2).await;
    assert_eq!(cache.len().await, 1);
    assert_eq!(cache.get(&"keep".to_string()).await, Some(1));
  }
}
