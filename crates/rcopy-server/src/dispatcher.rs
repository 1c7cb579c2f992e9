use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

/// An accepted connection waiting for a worker.
#[derive(Debug)]
pub struct ConnectionSlot<S> {
    pub id: u64,
    pub socket: S,
}

/// FIFO handing accepted sockets to workers in arrival order.
///
/// The accept loop enqueues, then spawns a worker that dequeues. Workers may
/// be scheduled late, but they always pick connections up in the order the
/// accept loop saw them.
pub struct ConnectionDispatcher<S> {
    inner: Arc<Mutex<DispatcherInner<S>>>,
}

struct DispatcherInner<S> {
    next_id: u64,
    queue: VecDeque<ConnectionSlot<S>>,
}

impl<S> Clone for ConnectionDispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> Default for ConnectionDispatcher<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ConnectionDispatcher<S> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DispatcherInner {
                next_id: 1,
                queue: VecDeque::new(),
            })),
        }
    }

    /// Store a socket and return its id. Ids start at 1 and never repeat.
    pub fn enqueue(&self, socket: S) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.queue.push_back(ConnectionSlot { id, socket });
        id
    }

    /// Oldest waiting connection, if any.
    pub fn dequeue(&self) -> Option<ConnectionSlot<S>> {
        self.inner.lock().queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_and_ids() {
        let dispatcher = ConnectionDispatcher::new();
        assert!(dispatcher.dequeue().is_none());
        assert_eq!(dispatcher.enqueue("a"), 1);
        assert_eq!(dispatcher.enqueue("b"), 2);
        assert_eq!(dispatcher.enqueue("c"), 3);
        assert_eq!(dispatcher.len(), 3);

        let first = dispatcher.dequeue().unwrap();
        assert_eq!((first.id, first.socket), (1, "a"));
        assert_eq!(dispatcher.enqueue("d"), 4);
        let order: Vec<(u64, &str)> = std::iter::from_fn(|| dispatcher.dequeue())
            .map(|slot| (slot.id, slot.socket))
            .collect();
        assert_eq!(order, vec![(2, "b"), (3, "c"), (4, "d")]);
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn test_each_slot_taken_once_across_threads() {
        let dispatcher = ConnectionDispatcher::new();
        for n in 0..1000u32 {
            dispatcher.enqueue(n);
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let d = dispatcher.clone();
                std::thread::spawn(move || {
                    let mut ids = Vec::new();
                    while let Some(slot) = d.dequeue() {
                        ids.push(slot.id);
                    }
                    ids
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            // each worker sees increasing ids
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            all.extend(ids);
        }
        all.sort_unstable();
        assert_eq!(all, (1..=1000).collect::<Vec<u64>>());
    }
}
