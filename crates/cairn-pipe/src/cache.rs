//! Process-wide memoization of compiled artifacts.
//!
//! Each key owns a slot guarded by a reentrant mutex. Two threads compiling
//! different keys never contend; a second thread asking for a key that is
//! being compiled blocks until the first finishes and then sees the same
//! result. The same thread re-entering a key it is compiling gets
//! [`PipeError::RecursiveCompile`] instead of a deadlock or a stack overflow.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, warn};

use crate::error::{PipeError, PipeResult};

enum SlotState<V> {
    Empty,
    Compiling { depth: usize },
    Ready(PipeResult<V>),
}

struct Slot<V> {
    state: ReentrantMutex<RefCell<SlotState<V>>>,
}

impl<V> Slot<V> {
    fn new() -> Self {
        Self {
            state: ReentrantMutex::new(RefCell::new(SlotState::Empty)),
        }
    }
}

/// Append-only map from key to a compiled value or a cached failure.
pub(crate) struct CompileCache<K, V> {
    label: &'static str,
    slots: Mutex<HashMap<K, Arc<Slot<V>>>>,
}

impl<K, V> CompileCache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone,
{
    pub(crate) fn new(label: &'static str) -> Self {
        Self {
            label,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Cached value for `key`, running `compile` on first use.
    ///
    /// Failures are cached like successes, so a broken type fails the same
    /// way on every later call.
    pub(crate) fn get_or_compile<F>(&self, key: &K, compile: F) -> PipeResult<V>
    where
        F: FnOnce() -> PipeResult<V>,
    {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(key.clone()).or_insert_with(|| Arc::new(Slot::new())))
        };

        let guard = slot.state.lock();
        {
            let mut state = guard.borrow_mut();
            match &mut *state {
                SlotState::Ready(result) => return result.clone(),
                SlotState::Compiling { depth } => {
                    *depth += 1;
                    debug!(cache = self.label, key = ?key, depth = *depth, "recursive compile");
                    return Err(PipeError::RecursiveCompile {
                        key: format!("{key:?}"),
                    });
                }
                SlotState::Empty => *state = SlotState::Compiling { depth: 0 },
            }
        }

        let result = compile();
        match &result {
            Ok(_) => debug!(cache = self.label, key = ?key, "compiled"),
            Err(err) => warn!(cache = self.label, key = ?key, error = %err, "compile failed"),
        }
        *guard.borrow_mut() = SlotState::Ready(result.clone());
        result
    }

    /// Number of keys with a slot, compiled or not.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn compiles_once() {
        let cache: CompileCache<u32, Arc<String>> = CompileCache::new("test");
        let calls = AtomicUsize::new(0);
        let make = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new("x".to_string()))
        };
        let a = cache.get_or_compile(&1, make).unwrap();
        let b = cache.get_or_compile(&1, make).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failures_are_replayed() {
        let cache: CompileCache<u32, u32> = CompileCache::new("test");
        let calls = AtomicUsize::new(0);
        let fail = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(PipeError::UnknownTypeId(9))
        };
        assert_eq!(cache.get_or_compile(&1, fail), Err(PipeError::UnknownTypeId(9)));
        assert_eq!(cache.get_or_compile(&1, fail), Err(PipeError::UnknownTypeId(9)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reentry_is_a_recursion_error() {
        let cache: CompileCache<u32, u32> = CompileCache::new("test");
        let outer = cache.get_or_compile(&7, || {
            let inner = cache.get_or_compile(&7, || Ok(1));
            assert!(matches!(inner, Err(PipeError::RecursiveCompile { .. })));
            Ok(2)
        });
        assert_eq!(outer, Ok(2));
        assert_eq!(cache.get_or_compile(&7, || Ok(3)), Ok(2));
    }

    #[test]
    fn nested_distinct_keys_compile() {
        let cache: CompileCache<u32, u32> = CompileCache::new("test");
        let outer = cache.get_or_compile(&1, || Ok(cache.get_or_compile(&2, || Ok(20))? + 1));
        assert_eq!(outer, Ok(21));
        assert_eq!(cache.get_or_compile(&2, || Ok(0)), Ok(20));
    }

    #[test]
    fn concurrent_first_use_sees_one_result() {
        let cache: Arc<CompileCache<u32, Arc<u64>>> = Arc::new(CompileCache::new("test"));
        let calls = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    cache
                        .get_or_compile(&1, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(10));
                            Ok(Arc::new(99))
                        })
                        .unwrap()
                })
            })
            .collect();
        let results: Vec<Arc<u64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    }
}
