//! Unbuffered hand-off point between producers and pollers
//!
//! Items are never stored on behalf of a producer that went away: a parked
//! item lives exactly as long as its [`ParkedItem`] handle, and a registered
//! poller as long as its [`Waiter`]. Pairing is first come, first served on
//! both sides. The internal lock is never held across an await and nothing
//! user-visible is dropped while it is held.
//!
//! A hand-off is settled by the taker. An item counts as taken only once the
//! taker's [`Waiter::recv`] returns it; a taker that goes away before that
//! sends the item back to its giver, which offers it to the next taker or
//! keeps it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

pub(crate) struct Rendezvous<T> {
    queues: Mutex<Queues<T>>,
    next_id: AtomicU64,
}

struct Queues<T> {
    takers: VecDeque<Taker<T>>,
    givers: VecDeque<Giver<T>>,
}

struct Taker<T> {
    id: u64,
    tx: oneshot::Sender<Handoff<T>>,
}

struct Giver<T> {
    id: u64,
    handoff: Handoff<T>,
}

/// An item on its way to a taker
///
/// Dropping `reply` accepts the item; sending on it returns the item.
struct Handoff<T> {
    item: T,
    reply: oneshot::Sender<T>,
}

impl<T> Handoff<T> {
    fn accept(self) -> T {
        self.item
    }

    fn reject(self) {
        // giver gone: the item is dropped here, outside any lock
        let _ = self.reply.send(self.item);
    }
}

impl<T> Queues<T> {
    /// Hand `handoff` to the oldest live taker
    fn hand_to_taker(&mut self, mut handoff: Handoff<T>) -> Result<(), Handoff<T>> {
        while let Some(taker) = self.takers.pop_front() {
            match taker.tx.send(handoff) {
                Ok(()) => return Ok(()),
                Err(returned) => handoff = returned,
            }
        }
        Err(handoff)
    }
}

impl<T> Rendezvous<T> {
    pub(crate) fn new() -> Self {
        Self {
            queues: Mutex::new(Queues {
                takers: VecDeque::new(),
                givers: VecDeque::new(),
            }),
            next_id: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Pair with a waiting taker, or hand the item back
    ///
    /// Does not wait for a taker to arrive, only for the ones already
    /// registered to accept or return the item.
    pub(crate) async fn give(&self, mut item: T) -> Result<(), T> {
        loop {
            let (reply, returned) = oneshot::channel();
            let handed = self.queues.lock().hand_to_taker(Handoff { item, reply });
            if let Err(handoff) = handed {
                return Err(handoff.item);
            }
            match returned.await {
                Err(_) => return Ok(()),
                Ok(back) => item = back,
            }
        }
    }

    /// Offer the item until a taker accepts it or the handle is withdrawn
    pub(crate) fn park(&self, item: T) -> ParkedItem<'_, T> {
        let id = self.next_id();
        ParkedItem {
            rendezvous: self,
            id,
            returned: Some(self.offer_parked(id, item, false)),
            settled: false,
        }
    }

    fn offer_parked(&self, id: u64, item: T, front: bool) -> oneshot::Receiver<T> {
        let (reply, returned) = oneshot::channel();
        let mut queues = self.queues.lock();
        if let Err(handoff) = queues.hand_to_taker(Handoff { item, reply }) {
            let giver = Giver { id, handoff };
            if front {
                queues.givers.push_front(giver);
            } else {
                queues.givers.push_back(giver);
            }
        }
        returned
    }

    /// Take a parked item if there is one, else register as a taker
    pub(crate) fn register(&self) -> Waiter<'_, T> {
        let id = self.next_id();
        let mut queues = self.queues.lock();
        if let Some(giver) = queues.givers.pop_front() {
            return Waiter {
                rendezvous: self,
                id,
                ready: Some(giver.handoff),
                rx: None,
                settled: false,
            };
        }
        let (tx, rx) = oneshot::channel();
        queues.takers.push_back(Taker { id, tx });
        Waiter {
            rendezvous: self,
            id,
            ready: None,
            rx: Some(rx),
            settled: false,
        }
    }

    /// Registered takers
    pub(crate) fn waiting_takers(&self) -> usize {
        self.queues.lock().takers.len()
    }

    /// Items waiting for a taker
    pub(crate) fn parked_items(&self) -> usize {
        self.queues.lock().givers.len()
    }

    fn remove_giver(&self, id: u64) -> Option<T> {
        let mut queues = self.queues.lock();
        let pos = queues.givers.iter().position(|g| g.id == id)?;
        queues.givers.remove(pos).map(|g| g.handoff.item)
    }

    fn remove_taker(&self, id: u64) -> bool {
        let removed = {
            let mut queues = self.queues.lock();
            queues
                .takers
                .iter()
                .position(|t| t.id == id)
                .and_then(|pos| queues.takers.remove(pos))
        };
        removed.is_some()
    }
}

/// Producer side of a parked item
pub(crate) struct ParkedItem<'a, T> {
    rendezvous: &'a Rendezvous<T>,
    id: u64,
    /// `None` once a taker accepted the item
    returned: Option<oneshot::Receiver<T>>,
    settled: bool,
}

impl<T> ParkedItem<'_, T> {
    /// Resolve once a taker accepted the item
    ///
    /// An item returned by a taker is parked again at the front. Cancel safe.
    pub(crate) async fn taken(&mut self) {
        while let Some(returned) = self.returned.as_mut() {
            match returned.await {
                Ok(item) => {
                    self.returned = Some(self.rendezvous.offer_parked(self.id, item, true));
                }
                Err(_) => self.returned = None,
            }
        }
        self.settled = true;
    }

    /// Take the item back; `None` means a taker accepted it
    ///
    /// An item in flight to a taker is waited for until the taker accepts
    /// or returns it.
    pub(crate) async fn withdraw(mut self) -> Option<T> {
        self.settled = true;
        let returned = self.returned.as_mut()?;
        if let Some(item) = self.rendezvous.remove_giver(self.id) {
            return Some(item);
        }
        returned.await.ok()
    }
}

impl<T> Drop for ParkedItem<'_, T> {
    fn drop(&mut self) {
        if !self.settled && self.returned.is_some() {
            let item = self.rendezvous.remove_giver(self.id);
            drop(item);
        }
    }
}

/// Taker side of a registration
///
/// Dropping a waiter that was handed an item it never returned from
/// [`recv`](Self::recv) sends the item back to its giver.
pub(crate) struct Waiter<'a, T> {
    rendezvous: &'a Rendezvous<T>,
    id: u64,
    ready: Option<Handoff<T>>,
    rx: Option<oneshot::Receiver<Handoff<T>>>,
    settled: bool,
}

impl<T> Waiter<'_, T> {
    /// Accept the item handed to this waiter
    ///
    /// Cancel safe: an item is accepted only when this resolves.
    pub(crate) async fn recv(&mut self) -> T {
        if let Some(handoff) = self.ready.take() {
            self.settled = true;
            return handoff.accept();
        }
        if let Some(rx) = self.rx.as_mut() {
            if let Ok(handoff) = rx.await {
                self.rx = None;
                self.settled = true;
                return handoff.accept();
            }
            self.rx = None;
        }
        std::future::pending().await
    }

    /// Stop waiting; accepts and returns an item handed over meanwhile
    pub(crate) fn cancel(mut self) -> Option<T> {
        self.settled = true;
        self.withdraw().map(Handoff::accept)
    }

    fn withdraw(&mut self) -> Option<Handoff<T>> {
        if let Some(handoff) = self.ready.take() {
            return Some(handoff);
        }
        let mut rx = self.rx.take()?;
        if self.rendezvous.remove_taker(self.id) {
            return None;
        }
        // popped by a giver: the send completed under the lock
        rx.try_recv().ok()
    }
}

impl<T> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(handoff) = self.withdraw() {
            handoff.reject();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_give_without_taker_returns_item() {
        let rv = Rendezvous::new();
        assert_eq!(rv.give(1).await, Err(1));
    }

    #[tokio::test]
    async fn test_give_to_registered_taker() {
        let rv = Rendezvous::new();
        let mut waiter = rv.register();
        assert_eq!(rv.waiting_takers(), 1);

        let (given, received) = tokio::join!(rv.give(7), waiter.recv());
        assert_eq!(given, Ok(()));
        assert_eq!(received, 7);
        assert_eq!(rv.waiting_takers(), 0);
    }

    #[tokio::test]
    async fn test_register_takes_parked_item() {
        let rv = Rendezvous::new();
        let mut parked = rv.park("task");
        assert_eq!(rv.parked_items(), 1);

        let mut waiter = rv.register();
        assert_eq!(waiter.recv().await, "task");
        parked.taken().await;
        assert!(parked.withdraw().await.is_none());
        assert_eq!(rv.parked_items(), 0);
    }

    #[tokio::test]
    async fn test_withdraw_returns_untaken_item() {
        let rv = Rendezvous::new();
        let parked = rv.park(3);
        assert_eq!(parked.withdraw().await, Some(3));
        assert_eq!(rv.parked_items(), 0);
    }

    #[test]
    fn test_dropped_park_handle_removes_item() {
        let rv = Rendezvous::new();
        drop(rv.park(3));
        assert_eq!(rv.parked_items(), 0);
        assert!(rv.register().cancel().is_none());
    }

    #[tokio::test]
    async fn test_fifo_pairing() {
        let rv = Rendezvous::new();
        let first = rv.park(1);
        let second = rv.park(2);

        let mut a = rv.register();
        let mut b = rv.register();
        assert_eq!(a.recv().await, 1);
        assert_eq!(b.recv().await, 2);
        assert!(first.withdraw().await.is_none());
        assert!(second.withdraw().await.is_none());
    }

    #[tokio::test]
    async fn test_cancelled_taker_is_skipped() {
        let rv = Rendezvous::new();
        let gone = rv.register();
        let mut live = rv.register();
        assert!(gone.cancel().is_none());

        let (given, received) = tokio::join!(rv.give(5), live.recv());
        assert_eq!(given, Ok(()));
        assert_eq!(received, 5);
    }

    #[tokio::test]
    async fn test_cancel_after_handoff_accepts_item() {
        let rv = Rendezvous::new();
        let mut parked = rv.park(9);
        let waiter = rv.register();
        assert_eq!(waiter.cancel(), Some(9));
        parked.taken().await;
        assert!(parked.withdraw().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_waiter_returns_item_to_giver() {
        let rv = Rendezvous::new();
        let waiter = rv.register();
        let (given, ()) = tokio::join!(rv.give(4), async move {
            tokio::task::yield_now().await;
            drop(waiter);
        });

        assert_eq!(given, Err(4));
        assert_eq!(rv.parked_items(), 0);
        assert_eq!(rv.waiting_takers(), 0);
    }

    #[tokio::test]
    async fn test_returned_item_goes_to_next_taker() {
        let rv = Rendezvous::new();
        let first = rv.register();
        let mut second = rv.register();
        let (given, received) = tokio::join!(rv.give(6), async move {
            drop(first);
            second.recv().await
        });

        assert_eq!(given, Ok(()));
        assert_eq!(received, 6);
    }

    #[tokio::test]
    async fn test_parked_item_returned_by_taker_is_parked_again() {
        let rv = Rendezvous::new();
        let mut parked = rv.park(8);
        drop(rv.register());
        assert_eq!(rv.parked_items(), 0);

        // the return is picked up the next time the giver waits
        let pending = tokio::time::timeout(Duration::from_millis(10), parked.taken()).await;
        assert!(pending.is_err());
        assert_eq!(rv.parked_items(), 1);
        assert_eq!(parked.withdraw().await, Some(8));
    }

    #[tokio::test]
    async fn test_parked_item_wakes_on_take() {
        let rv = Arc::new(Rendezvous::new());
        let taker = Arc::clone(&rv);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            taker.register().recv().await
        });

        let mut parked = rv.park("hello");
        tokio::time::timeout(Duration::from_secs(1), parked.taken())
            .await
            .unwrap();
        assert_eq!(handle.await.unwrap(), "hello");
    }
}
