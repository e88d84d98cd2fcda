//! A keyed resource pool with reservation-by-token hand-off.
//!
//! Entries are checked out exclusively; contended check-outs park on the
//! same waiter cell primitive the selector uses. When a resource comes back
//! and waiters exist, it is *reserved* for the first eligible waiter before
//! that waiter is woken: the woken task claims by token and cannot lose a
//! race against a fast-path caller, so there is no thundering herd and no
//! re-checkout race.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use log::trace;

use crate::waiter::WaiterCell;
use crate::Error;

/// Default bound on parked waiters per entry.
const DEFAULT_WAITER_CAPACITY: usize = 64;

enum EntryState<R> {
    /// In the pool, free to take.
    Present(R),
    /// Held by a [`PoolGuard`].
    CheckedOut,
    /// Came back while waiters existed; bound to one of them by token.
    Reserved { token: u64, resource: R },
    /// Removed while checked out; the resource is dropped at check-in.
    Destroyed,
}

struct PoolWaiter {
    token: u64,
    cell: Arc<WaiterCell<()>>,
}

struct Entry<R> {
    state: EntryState<R>,
    waiters: VecDeque<PoolWaiter>,
}

struct PoolShared<R> {
    entries: Mutex<HashMap<u64, Entry<R>>>,
    next_token: AtomicU64,
    waiter_capacity: usize,
}

/// A keyed pool of exclusively checked-out resources.
///
/// Cheaply cloneable handle; all clones share the entries.
pub struct Pool<R> {
    shared: Arc<PoolShared<R>>,
}

impl<R> Clone for Pool<R> {
    fn clone(&self) -> Pool<R> {
        Pool {
            shared: self.shared.clone(),
        }
    }
}

impl<R> Pool<R> {
    pub fn new() -> Pool<R> {
        Pool::with_waiter_capacity(DEFAULT_WAITER_CAPACITY)
    }

    /// A pool whose per-entry waiter queues hold at most `capacity` parked
    /// check-outs; the next one fails with [`Error::WaitersFull`].
    pub fn with_waiter_capacity(capacity: usize) -> Pool<R> {
        Pool {
            shared: Arc::new(PoolShared {
                entries: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
                waiter_capacity: capacity,
            }),
        }
    }

    /// Adds a resource under `id`. Fails with [`Error::InvalidId`] when the
    /// id is already present.
    pub fn insert(&self, id: u64, resource: R) -> Result<(), Error> {
        let mut entries = self.shared.entries.lock().unwrap();
        if entries.contains_key(&id) {
            return Err(Error::InvalidId);
        }
        entries.insert(
            id,
            Entry {
                state: EntryState::Present(resource),
                waiters: VecDeque::new(),
            },
        );
        Ok(())
    }

    /// Checks the entry out exclusively, suspending while it is held
    /// elsewhere. The guard checks it back in on drop.
    pub fn checkout(&self, id: u64) -> CheckOut<R> {
        CheckOut {
            shared: self.shared.clone(),
            id,
            state: CheckOutState::Init,
        }
    }

    /// Checks `id` out, runs `body` on the resource and checks it back in,
    /// also on panic.
    pub async fn transaction<T>(
        &self,
        id: u64,
        body: impl FnOnce(&mut R) -> T,
    ) -> Result<T, Error> {
        let mut guard = self.checkout(id).await?;
        Ok(body(&mut guard))
    }

    /// Removes `id` from the pool.
    ///
    /// Returns the resource when it is in the pool (present or reserved); a
    /// checked-out entry is marked destroyed and its resource is dropped at
    /// check-in. Parked waiters are woken and observe [`Error::InvalidId`].
    pub fn remove(&self, id: u64) -> Option<R> {
        let (resource, wakers) = {
            let mut entries = self.shared.entries.lock().unwrap();
            let Some(entry) = entries.get_mut(&id) else {
                return None;
            };

            let mut wakers = Vec::new();
            for waiter in entry.waiters.drain(..) {
                if let Some((waker, _)) = waiter.cell.resume(()) {
                    wakers.push(waker);
                }
            }

            let resource = match mem::replace(&mut entry.state, EntryState::Destroyed) {
                EntryState::Present(resource) | EntryState::Reserved { resource, .. } => {
                    entries.remove(&id);
                    Some(resource)
                }
                EntryState::CheckedOut => None,
                EntryState::Destroyed => None,
            };
            (resource, wakers)
        };

        for waker in wakers {
            waker.wake();
        }
        resource
    }

    /// Number of entries, including destroyed ones awaiting check-in.
    pub fn len(&self) -> usize {
        self.shared.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R> Default for Pool<R> {
    fn default() -> Pool<R> {
        Pool::new()
    }
}

/// Returns a resource to its entry, reserving it for the first eligible
/// waiter if any is parked.
fn check_in<R>(shared: &PoolShared<R>, id: u64, resource: R) {
    let waker = {
        let mut entries = shared.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(&id) else {
            // Entry vanished; the resource is surplus.
            return;
        };

        if matches!(entry.state, EntryState::Destroyed) {
            entries.remove(&id);
            None
        } else {
            let mut resource = Some(resource);
            let mut waker = None;
            while let Some(waiter) = entry.waiters.pop_front() {
                if waiter.cell.is_eligible() {
                    trace!("pool entry {} reserved for waiter {}", id, waiter.token);
                    entry.state = EntryState::Reserved {
                        token: waiter.token,
                        resource: resource.take().unwrap(),
                    };
                    waker = waiter.cell.resume(()).map(|(waker, _)| waker);
                    break;
                }
                // A cancelled husk; skip it.
            }
            if let Some(resource) = resource {
                entry.state = EntryState::Present(resource);
            }
            waker
        }
    };

    if let Some(waker) = waker {
        waker.wake();
    }
}

// ===== impl CheckOut =====

enum CheckOutState {
    Init,
    Waiting {
        token: u64,
        cell: Arc<WaiterCell<()>>,
    },
    Done,
}

/// Future returned by [`Pool::checkout`].
pub struct CheckOut<R> {
    shared: Arc<PoolShared<R>>,
    id: u64,
    state: CheckOutState,
}

impl<R> Future for CheckOut<R> {
    type Output = Result<PoolGuard<R>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match &this.state {
                CheckOutState::Init => {
                    let mut entries = this.shared.entries.lock().unwrap();
                    let Some(entry) = entries.get_mut(&this.id) else {
                        this.state = CheckOutState::Done;
                        return Poll::Ready(Err(Error::InvalidId));
                    };
                    if matches!(entry.state, EntryState::Destroyed) {
                        this.state = CheckOutState::Done;
                        return Poll::Ready(Err(Error::InvalidId));
                    }
                    if matches!(entry.state, EntryState::Present(_)) {
                        let EntryState::Present(resource) =
                            mem::replace(&mut entry.state, EntryState::CheckedOut)
                        else {
                            unreachable!()
                        };
                        drop(entries);
                        this.state = CheckOutState::Done;
                        return Poll::Ready(Ok(PoolGuard {
                            shared: this.shared.clone(),
                            id: this.id,
                            resource: Some(resource),
                        }));
                    }

                    // Checked out or reserved elsewhere: park.
                    if entry.waiters.len() >= this.shared.waiter_capacity {
                        this.state = CheckOutState::Done;
                        return Poll::Ready(Err(Error::WaitersFull));
                    }
                    let token = this.shared.next_token.fetch_add(1, Ordering::Relaxed);
                    let cell = Arc::new(WaiterCell::new());
                    cell.arm(cx.waker());
                    entry.waiters.push_back(PoolWaiter {
                        token,
                        cell: cell.clone(),
                    });
                    this.state = CheckOutState::Waiting { token, cell };
                    return Poll::Pending;
                }
                CheckOutState::Waiting { token, cell } => {
                    if cell.try_take().is_none() {
                        if cell.arm(cx.waker()) {
                            return Poll::Pending;
                        }
                        continue;
                    }
                    let token = *token;
                    this.state = CheckOutState::Done;

                    let mut entries = this.shared.entries.lock().unwrap();
                    let Some(entry) = entries.get_mut(&this.id) else {
                        return Poll::Ready(Err(Error::InvalidId));
                    };
                    // Claim by token: the resource was bound to us before the
                    // wake, so nothing can have raced it away. A plain
                    // `Present` take covers the destroy-then-reinsert case.
                    let claimable = match &entry.state {
                        EntryState::Reserved { token: bound, .. } => *bound == token,
                        EntryState::Present(_) => true,
                        _ => false,
                    };
                    if !claimable {
                        return Poll::Ready(Err(Error::InvalidId));
                    }
                    let resource =
                        match mem::replace(&mut entry.state, EntryState::CheckedOut) {
                            EntryState::Reserved { resource, .. }
                            | EntryState::Present(resource) => resource,
                            _ => unreachable!(),
                        };
                    drop(entries);
                    return Poll::Ready(Ok(PoolGuard {
                        shared: this.shared.clone(),
                        id: this.id,
                        resource: Some(resource),
                    }));
                }
                CheckOutState::Done => panic!("CheckOut polled after completion"),
            }
        }
    }
}

impl<R> Drop for CheckOut<R> {
    fn drop(&mut self) {
        let CheckOutState::Waiting { token, cell } = &self.state else {
            return;
        };
        cell.cancel();

        let release = {
            let mut entries = self.shared.entries.lock().unwrap();
            let Some(entry) = entries.get_mut(&self.id) else {
                return;
            };
            entry.waiters.retain(|waiter| waiter.token != *token);
            if matches!(&entry.state, EntryState::Reserved { token: bound, .. } if bound == token)
            {
                let EntryState::Reserved { resource, .. } =
                    mem::replace(&mut entry.state, EntryState::CheckedOut)
                else {
                    unreachable!()
                };
                Some(resource)
            } else {
                None
            }
        };

        // A reservation bound to a cancelled waiter goes back through
        // check-in so the next waiter (or the pool) gets the resource.
        if let Some(resource) = release {
            check_in(&self.shared, self.id, resource);
        }
    }
}

/// Exclusive access to a pooled resource; checks back in on drop.
pub struct PoolGuard<R> {
    shared: Arc<PoolShared<R>>,
    id: u64,
    resource: Option<R>,
}

impl<R> Deref for PoolGuard<R> {
    type Target = R;

    fn deref(&self) -> &R {
        self.resource.as_ref().expect("guard after check-in")
    }
}

impl<R> DerefMut for PoolGuard<R> {
    fn deref_mut(&mut self) -> &mut R {
        self.resource.as_mut().expect("guard after check-in")
    }
}

impl<R> Drop for PoolGuard<R> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            check_in(&self.shared, self.id, resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn fast_path_checkout() {
        let pool = Pool::new();
        pool.insert(1, String::from("a")).unwrap();
        let guard = block_on(pool.checkout(1)).unwrap();
        assert_eq!(*guard, "a");
        drop(guard);
        assert!(block_on(pool.checkout(1)).is_ok());
    }

    #[test]
    fn duplicate_insert_rejected() {
        let pool = Pool::new();
        pool.insert(1, 1u32).unwrap();
        assert!(matches!(pool.insert(1, 2u32), Err(Error::InvalidId)));
    }

    #[test]
    fn unknown_id_fails() {
        let pool: Pool<u32> = Pool::new();
        assert!(matches!(block_on(pool.checkout(9)), Err(Error::InvalidId)));
    }

    #[test]
    fn waiters_full() {
        let pool = Pool::with_waiter_capacity(0);
        pool.insert(1, 1u32).unwrap();
        let _held = block_on(pool.checkout(1)).unwrap();
        assert!(matches!(block_on(pool.checkout(1)), Err(Error::WaitersFull)));
    }

    #[test]
    fn remove_present_returns_resource() {
        let pool = Pool::new();
        pool.insert(1, 7u32).unwrap();
        assert_eq!(pool.remove(1), Some(7));
        assert!(pool.is_empty());
    }

    #[test]
    fn remove_checked_out_destroys_at_check_in() {
        let pool = Pool::new();
        pool.insert(1, 7u32).unwrap();
        let guard = block_on(pool.checkout(1)).unwrap();
        assert_eq!(pool.remove(1), None);
        assert_eq!(pool.len(), 1);
        drop(guard);
        assert!(pool.is_empty());
        assert!(matches!(block_on(pool.checkout(1)), Err(Error::InvalidId)));
    }

    #[test]
    fn transaction_returns_body_result() {
        let pool = Pool::new();
        pool.insert(1, vec![1u8, 2]).unwrap();
        let len = block_on(pool.transaction(1, |v| {
            v.push(3);
            v.len()
        }))
        .unwrap();
        assert_eq!(len, 3);
        let guard = block_on(pool.checkout(1)).unwrap();
        assert_eq!(*guard, vec![1, 2, 3]);
    }
}

impl<R> std::fmt::Debug for Pool<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl<R> std::fmt::Debug for CheckOut<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckOut").field("id", &self.id).finish_non_exhaustive()
    }
}

impl<R> std::fmt::Debug for PoolGuard<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolGuard").field("id", &self.id).finish_non_exhaustive()
    }
}
