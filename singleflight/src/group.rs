use parking_lot::{Condvar, Mutex};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{instrument, trace};

enum Status<T, E> {
    Pending,
    Done(Result<T, E>),
    LeaderDrop,
}

struct Call<T, E> {
    status: Mutex<Status<T, E>>,
    done: Condvar,
    // Only touched while the registry lock is held.
    dups: AtomicUsize,
}

impl<T, E> Call<T, E> {
    fn new() -> Self {
        Call {
            status: Mutex::new(Status::Pending),
            done: Condvar::new(),
            dups: AtomicUsize::new(0),
        }
    }
}

impl<T: Clone, E: Clone> Call<T, E> {
    /// Blocks until the leader lands. `None` means the leader unwound
    /// without producing a result.
    fn wait(&self) -> Option<Result<T, E>> {
        let mut status = self.status.lock();
        while matches!(*status, Status::Pending) {
            self.done.wait(&mut status);
        }
        match &*status {
            Status::Done(result) => Some(result.clone()),
            _ => None,
        }
    }
}

type Registry<K, T, E> = Mutex<HashMap<K, Arc<Call<T, E>>>>;

/// Group represents a class of work and creates a space in which units of work
/// can be executed with duplicate suppression.
///
/// Clones share the same set of in-flight calls.
pub struct Group<T, E, K = String> {
    calls: Arc<Registry<K, T, E>>,
}

impl<T, E, K> Group<T, E, K> {
    pub fn new() -> Self {
        Group {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of keys that currently have a call in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}

impl<T, E, K> Group<T, E, K>
where
    T: Clone,
    E: Clone,
    K: Hash + Eq,
{
    /// work executes and returns the results of the given function, making
    /// sure that only one execution is in-flight for a given key at a
    /// time. If a duplicate comes in, the duplicate caller waits for the
    /// original to complete and receives the same results.
    pub fn work<Q, F>(&self, key: &Q, work: F) -> Result<T, E>
    where
        K: Borrow<Q>,
        Q: ToOwned<Owned = K> + Hash + Eq + fmt::Debug + ?Sized,
        F: FnOnce() -> Result<T, E>,
    {
        self.work_shared(key, work).0
    }

    /// Like [`Group::work`]. The returned flag reports whether the result was
    /// given to more than one caller.
    #[instrument(level = "trace", skip(self, work))]
    pub fn work_shared<Q, F>(&self, key: &Q, work: F) -> (Result<T, E>, bool)
    where
        K: Borrow<Q>,
        Q: ToOwned<Owned = K> + Hash + Eq + fmt::Debug + ?Sized,
        F: FnOnce() -> Result<T, E>,
    {
        loop {
            let mut calls = self.calls.lock();
            let joined = calls.get(key).cloned();
            if let Some(call) = joined {
                call.dups.fetch_add(1, Ordering::Relaxed);
                drop(calls);

                trace!("Joined in-flight call, waiting...");
                match call.wait() {
                    Some(result) => {
                        trace!("Work done noticed");
                        return (result, true);
                    }
                    None => {
                        trace!("Leader dropped, retrying");
                        continue;
                    }
                }
            }

            let call = Arc::new(Call::new());
            calls.insert(key.to_owned(), Arc::clone(&call));
            drop(calls);

            let flight = Flight {
                calls: &self.calls,
                key,
                call,
                landed: false,
            };
            trace!("working...");
            let result = work();
            return flight.land(result);
        }
    }
}

impl<T, E, K> Clone for Group<T, E, K> {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<T, E, K> Default for Group<T, E, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E, K> fmt::Debug for Group<T, E, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// The leader's handle on its call. Dropping it without landing (the work
/// function panicked) releases the waiters so one of them can lead again.
struct Flight<'a, K, Q, T, E>
where
    K: Borrow<Q> + Hash + Eq,
    Q: Hash + Eq + ?Sized,
{
    calls: &'a Registry<K, T, E>,
    key: &'a Q,
    call: Arc<Call<T, E>>,
    landed: bool,
}

impl<K, Q, T, E> Flight<'_, K, Q, T, E>
where
    K: Borrow<Q> + Hash + Eq,
    Q: Hash + Eq + ?Sized,
    T: Clone,
    E: Clone,
{
    fn land(mut self, result: Result<T, E>) -> (Result<T, E>, bool) {
        let mut calls = self.calls.lock();
        calls.remove(self.key);
        let shared = self.call.dups.load(Ordering::Relaxed) > 0;
        // With no waiters and the entry gone, nobody can read the slot.
        if shared {
            *self.call.status.lock() = Status::Done(result.clone());
        }
        self.landed = true;
        drop(calls);

        if shared {
            self.call.done.notify_all();
        }
        trace!(shared, "Work done, entry removed");
        (result, shared)
    }
}

impl<K, Q, T, E> Drop for Flight<'_, K, Q, T, E>
where
    K: Borrow<Q> + Hash + Eq,
    Q: Hash + Eq + ?Sized,
{
    fn drop(&mut self) {
        if self.landed {
            return;
        }
        let mut calls = self.calls.lock();
        calls.remove(self.key);
        *self.call.status.lock() = Status::LeaderDrop;
        drop(calls);

        self.call.done.notify_all();
        trace!("Leader dropped before landing");
    }
}
