use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Map of independently locked slots.
///
/// The index lock is only held while a slot is looked up or inserted; callers
/// then lock the slot itself, so work on one key never waits on another key.
pub struct KeyedState<K, V> {
    slots: Mutex<HashMap<K, Arc<Mutex<V>>>>,
}

impl<K, V> Default for KeyedState<K, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> KeyedState<K, V>
where
    K: Eq + Hash + Clone,
    V: Default,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn slot(&self, key: &K) -> Arc<Mutex<V>> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(V::default())))
            .clone()
    }

    pub async fn existing(&self, key: &K) -> Option<Arc<Mutex<V>>> {
        self.slots.lock().await.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_returns_same_slot() {
        let state: KeyedState<i64, Vec<u32>> = KeyedState::new();
        state.slot(&1).await.lock().await.push(7);
        assert_eq!(*state.slot(&1).await.lock().await, vec![7]);
        assert!(state.existing(&2).await.is_none());
    }

    #[tokio::test]
    async fn held_slot_does_not_block_other_keys() {
        let state: KeyedState<i64, u32> = KeyedState::new();
        let first = state.slot(&1).await;
        let _guard = first.lock().await;

        let other = tokio::time::timeout(Duration::from_millis(200), async {
            let slot = state.slot(&2).await;
            let mut value = slot.lock().await;
            *value += 1;
            *value
        })
        .await
        .expect("other key must not wait");
        assert_eq!(other, 1);
    }
}
