use std::collections::hash_map::RandomState;
use std::collections::{HashMap, VecDeque};
use std::hash::{BuildHasher, Hash};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default number of lock shards.
pub const DEFAULT_QUEUE_SHARDS: usize = 16;

type Shard<K, V> = HashMap<K, VecDeque<V>>;

/// Per-key FIFO of values that cannot proceed yet.
///
/// Keys are spread over independently locked shards, so operations on
/// different keys rarely contend. Every operation on one key is atomic and
/// keeps insertion order.
pub struct WaitingQueues<K, V> {
    shards: Box<[Mutex<Shard<K, V>>]>,
    hasher: RandomState,
}

impl<K, V> Default for WaitingQueues<K, V>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self::with_shards(DEFAULT_QUEUE_SHARDS)
    }
}

impl<K, V> WaitingQueues<K, V>
where
    K: Hash + Eq,
{
    pub fn with_shards(shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, key: &K) -> MutexGuard<'_, Shard<K, V>> {
        let idx = (self.hasher.hash_one(key) as usize) % self.shards.len();
        self.shards[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_all(&self) -> impl Iterator<Item = MutexGuard<'_, Shard<K, V>>> {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Appends `value` to the queue of `key`, creating it if absent.
    pub fn enqueue(&self, key: K, value: V) {
        self.shard(&key).entry(key).or_default().push_back(value);
    }

    /// Removes and returns every value queued under `key`, oldest first.
    pub fn take(&self, key: &K) -> Vec<V> {
        self.shard(key)
            .remove(key)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Removes the oldest value queued under `key`.
    pub fn pop_front(&self, key: &K) -> Option<V> {
        let mut shard = self.shard(key);
        let queue = shard.get_mut(key)?;
        let value = queue.pop_front();
        if queue.is_empty() {
            shard.remove(key);
        }
        value
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.shard(key).contains_key(key)
    }

    /// Number of values queued under `key`.
    pub fn len_of(&self, key: &K) -> usize {
        self.shard(key).get(key).map_or(0, VecDeque::len)
    }

    /// Total number of queued values across all keys.
    pub fn len(&self) -> usize {
        self.lock_all()
            .map(|shard| shard.values().map(VecDeque::len).sum::<usize>())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_all().all(|shard| shard.is_empty())
    }

    /// Drains every queue.
    pub fn remove_all(&self) -> HashMap<K, Vec<V>> {
        let mut out = HashMap::new();
        for mut shard in self.lock_all() {
            out.extend(shard.drain().map(|(k, q)| (k, Vec::from(q))));
        }
        out
    }

    /// Removes every value matching `pred`, keeping the order of the rest.
    ///
    /// Each shard is swept under its own lock.
    pub fn remove_where<F>(&self, mut pred: F) -> Vec<(K, V)>
    where
        K: Clone,
        F: FnMut(&K, &V) -> bool,
    {
        let mut removed = Vec::new();
        for mut shard in self.lock_all() {
            shard.retain(|key, queue| {
                let (drop, keep): (VecDeque<V>, VecDeque<V>) =
                    queue.drain(..).partition(|v| pred(key, v));
                removed.extend(drop.into_iter().map(|v| (key.clone(), v)));
                *queue = keep;
                !queue.is_empty()
            });
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::WaitingQueues;

    #[test]
    fn take_returns_values_in_enqueue_order() {
        let queues = WaitingQueues::default();
        for i in 0..10 {
            queues.enqueue("k", i);
        }
        queues.enqueue("other", 100);

        assert_eq!(queues.take(&"k"), (0..10).collect::<Vec<_>>());
        assert!(queues.take(&"k").is_empty());
        assert_eq!(queues.len(), 1);
    }

    #[test]
    fn missing_key_is_empty_not_an_error() {
        let queues: WaitingQueues<u32, u32> = WaitingQueues::with_shards(1);
        assert!(queues.take(&7).is_empty());
        assert!(queues.pop_front(&7).is_none());
        assert!(!queues.contains_key(&7));
        assert!(queues.is_empty());
    }

    #[test]
    fn pop_front_drops_empty_keys() {
        let queues = WaitingQueues::with_shards(2);
        queues.enqueue(1, "a");
        queues.enqueue(1, "b");
        assert_eq!(queues.pop_front(&1), Some("a"));
        assert_eq!(queues.len_of(&1), 1);
        assert_eq!(queues.pop_front(&1), Some("b"));
        assert!(!queues.contains_key(&1));
    }

    #[test]
    fn remove_all_drains_every_key() {
        let queues = WaitingQueues::with_shards(4);
        queues.enqueue(1, 'a');
        queues.enqueue(2, 'b');
        queues.enqueue(1, 'c');

        let drained = queues.remove_all();
        assert_eq!(drained.get(&1), Some(&vec!['a', 'c']));
        assert_eq!(drained.get(&2), Some(&vec!['b']));
        assert!(queues.is_empty());
    }

    #[test]
    fn remove_where_keeps_order_of_survivors() {
        let queues = WaitingQueues::with_shards(3);
        for i in 0..6 {
            queues.enqueue(i % 2, i);
        }

        let mut removed = queues.remove_where(|_, v| *v >= 4);
        removed.sort();
        assert_eq!(removed, vec![(0, 4), (1, 5)]);
        assert_eq!(queues.take(&0), vec![0, 2]);
        assert_eq!(queues.take(&1), vec![1, 3]);
    }

    #[test]
    fn concurrent_producers_keep_per_producer_order() {
        let queues = Arc::new(WaitingQueues::default());
        let handles: Vec<_> = (0..4_u32)
            .map(|producer| {
                let queues = queues.clone();
                thread::spawn(move || {
                    for seq in 0..500_u32 {
                        queues.enqueue(producer % 2, (producer, seq));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("producer should finish");
        }

        for key in 0..2 {
            let values = queues.take(&key);
            assert_eq!(values.len(), 1_000);
            for producer in [key, key + 2] {
                let seqs: Vec<u32> = values
                    .iter()
                    .filter(|(p, _)| *p == producer)
                    .map(|(_, s)| *s)
                    .collect();
                assert_eq!(seqs, (0..500).collect::<Vec<_>>());
            }
        }
    }
}
