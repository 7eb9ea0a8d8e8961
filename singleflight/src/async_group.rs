use core::future::Future;
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{instrument, trace};

enum Status<T, E> {
    Pending,
    Done(Result<T, E>),
    LeaderDrop,
}

struct Call<T, E> {
    status: watch::Sender<Status<T, E>>,
    // Only touched while the registry lock is held.
    dups: AtomicUsize,
}

impl<T, E> Call<T, E> {
    fn new() -> Self {
        let (status, _) = watch::channel(Status::Pending);
        Call {
            status,
            dups: AtomicUsize::new(0),
        }
    }
}

impl<T: Clone, E: Clone> Call<T, E> {
    async fn wait(&self) -> Option<Result<T, E>> {
        let mut rx = self.status.subscribe();
        // The sender lives inside `self`, so the channel cannot close under us.
        let status = rx
            .wait_for(|status| !matches!(status, Status::Pending))
            .await
            .ok()?;
        match &*status {
            Status::Done(result) => Some(result.clone()),
            _ => None,
        }
    }
}

type Registry<K, T, E> = Mutex<HashMap<K, Arc<Call<T, E>>>>;

enum Role<T, E> {
    Lead(Arc<Call<T, E>>),
    Join(Arc<Call<T, E>>),
}

/// AsyncGroup is the async counterpart of [`crate::Group`]: waiters suspend
/// on the in-flight call instead of blocking their thread.
pub struct AsyncGroup<T, E, K = String> {
    calls: Arc<Registry<K, T, E>>,
}

impl<T, E, K> AsyncGroup<T, E, K> {
    pub fn new() -> Self {
        AsyncGroup {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of keys that currently have a call in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}

impl<T, E, K> AsyncGroup<T, E, K>
where
    T: Clone,
    E: Clone,
    K: Hash + Eq,
{
    /// work runs the future built by `work` unless a call for `key` is
    /// already in flight, in which case it waits for that call and returns
    /// its result. Only the leader invokes `work`.
    pub async fn work<Q, F, Fut>(&self, key: &Q, work: F) -> Result<T, E>
    where
        K: Borrow<Q>,
        Q: ToOwned<Owned = K> + Hash + Eq + fmt::Debug + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.work_shared(key, work).await.0
    }

    /// Like [`AsyncGroup::work`]. The returned flag reports whether the
    /// result was given to more than one caller.
    #[instrument(level = "trace", skip(self, work))]
    pub async fn work_shared<Q, F, Fut>(&self, key: &Q, work: F) -> (Result<T, E>, bool)
    where
        K: Borrow<Q>,
        Q: ToOwned<Owned = K> + Hash + Eq + fmt::Debug + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        loop {
            // The registry guard must not live across an await.
            let role = {
                let mut calls = self.calls.lock();
                let joined = calls.get(key).cloned();
                match joined {
                    Some(call) => {
                        call.dups.fetch_add(1, Ordering::Relaxed);
                        Role::Join(call)
                    }
                    None => {
                        let call = Arc::new(Call::new());
                        calls.insert(key.to_owned(), Arc::clone(&call));
                        Role::Lead(call)
                    }
                }
            };

            match role {
                Role::Join(call) => {
                    trace!("Joined in-flight call, waiting...");
                    match call.wait().await {
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
                Role::Lead(call) => {
                    let flight = Flight {
                        calls: &self.calls,
                        key,
                        call,
                        landed: false,
                    };
                    trace!("working...");
                    let result = work().await;
                    return flight.land(result);
                }
            }
        }
    }
}

impl<T, E, K> Clone for AsyncGroup<T, E, K> {
    fn clone(&self) -> Self {
        Self {
            calls: Arc::clone(&self.calls),
        }
    }
}

impl<T, E, K> Default for AsyncGroup<T, E, K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E, K> fmt::Debug for AsyncGroup<T, E, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncGroup")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Held by the leader while its future runs. If the future is dropped
/// before landing, the waiters are woken and one of them leads again.
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
        if shared {
            // Stores the result and wakes every subscriber in one step.
            self.call.status.send_replace(Status::Done(result.clone()));
        }
        self.landed = true;
        drop(calls);

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
        self.call.status.send_replace(Status::LeaderDrop);
        drop(calls);

        trace!("Leader dropped before landing");
    }
}

#[cfg(test)]
mod tests {
    use super::AsyncGroup;
    use std::convert::Infallible;
    use std::io::Error as IOErr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::task::JoinSet;
    use tokio::time::sleep;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn test_async_work() {
        let group: AsyncGroup<String, Arc<IOErr>> = AsyncGroup::new();
        let res = group.work("key", || async { Ok("bar".to_string()) }).await;
        assert_eq!(res.unwrap(), "bar");
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_async_work_error() {
        let group: AsyncGroup<String, Arc<IOErr>> = AsyncGroup::new();
        let some_err = Arc::new(IOErr::other("some error"));
        let res = group
            .work("key", || async { Err(Arc::clone(&some_err)) })
            .await;
        assert!(Arc::ptr_eq(&res.unwrap_err(), &some_err));

        let res = group.work("key", || async { Ok("bar".to_string()) }).await;
        assert_eq!(res.unwrap(), "bar");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_async_work_suppresses_duplicates() {
        let group: AsyncGroup<String, Infallible> = AsyncGroup::new();
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = JoinSet::new();
        for _ in 0..10 {
            let group = group.clone();
            let gate = Arc::clone(&gate);
            let calls = Arc::clone(&calls);
            tasks.spawn(async move {
                group
                    .work_shared("key", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok("bar".to_string())
                    })
                    .await
            });
        }

        // let the tasks above park on the flight
        sleep(Duration::from_millis(100)).await;
        gate.notify_one();

        while let Some(res) = tasks.join_next().await {
            assert_eq!(res.unwrap(), (Ok("bar".to_string()), true));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_async_error_is_shared_with_waiters() {
        let group: AsyncGroup<(), Arc<IOErr>> = AsyncGroup::new();
        let gate = Arc::new(Notify::new());

        let mut tasks = JoinSet::new();
        for _ in 0..5 {
            let group = group.clone();
            let gate = Arc::clone(&gate);
            tasks.spawn(async move {
                group
                    .work("key", move || async move {
                        gate.notified().await;
                        Err(Arc::new(IOErr::other("flight failed")))
                    })
                    .await
            });
        }

        sleep(Duration::from_millis(100)).await;
        gate.notify_one();

        let mut errs = Vec::new();
        while let Some(res) = tasks.join_next().await {
            errs.push(res.unwrap().unwrap_err());
        }
        assert_eq!(errs.len(), 5);
        for err in &errs[1..] {
            assert!(Arc::ptr_eq(err, &errs[0]));
        }
    }

    #[tokio::test]
    async fn test_async_sequential_calls_run_again() {
        let group: AsyncGroup<&'static str, Infallible> = AsyncGroup::new();
        assert_eq!(group.work("key", || async { Ok("first") }).await, Ok("first"));
        assert_eq!(group.work("key", || async { Ok("second") }).await, Ok("second"));
    }

    #[tokio::test]
    async fn test_async_distinct_keys_do_not_block() {
        let group: AsyncGroup<u32, Infallible> = AsyncGroup::new();
        let gate = Arc::new(Notify::new());

        let slow = {
            let group = group.clone();
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                group
                    .work("a", move || async move {
                        gate.notified().await;
                        Ok(1)
                    })
                    .await
            })
        };
        while group.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(group.work("b", || async { Ok(2) }).await, Ok(2));
        assert_eq!(group.in_flight(), 1);

        gate.notify_one();
        assert_eq!(slow.await.unwrap(), Ok(1));
        assert_eq!(group.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_waiter_takes_over_when_leader_is_dropped() {
        let group: AsyncGroup<u32, Infallible> = AsyncGroup::new();

        let leader = {
            let group = group.clone();
            tokio::spawn(async move {
                group
                    .work("key", std::future::pending::<Result<u32, Infallible>>)
                    .await
            })
        };
        while group.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let group = group.clone();
            tokio::spawn(async move { group.work("key", || async { Ok(7) }).await })
        };
        sleep(Duration::from_millis(50)).await;
        leader.abort();

        assert!(leader.await.unwrap_err().is_cancelled());
        assert_eq!(waiter.await.unwrap(), Ok(7));
        assert_eq!(group.in_flight(), 0);
    }
}
