use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, SendTimeoutError, TryRecvError};

/// How long either end waits before looking at the cancel flag again.
pub const WAIT_SLICE: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
struct Flags {
    cancelled: AtomicBool,
    failed: AtomicBool,
}

/// Shared stop flag for one acquisition run. Clones observe the same state.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flags: Arc<Flags>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flags.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags.cancelled.load(Ordering::SeqCst)
    }

    /// Marks the run as failed and cancels it.
    pub fn fail(&self) {
        self.flags.failed.store(true, Ordering::SeqCst);
        self.cancel();
    }

    pub fn has_failed(&self) -> bool {
        self.flags.failed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError<T> {
    /// Cancelled while the queue was full; the item is handed back.
    Aborted(T),
    Disconnected(T),
}

#[derive(Debug, PartialEq)]
pub enum Received<T> {
    Item(T),
    Cancelled,
    Closed,
}

pub struct QueueSender<T> {
    inner: channel::Sender<T>,
    cancel: CancelToken,
}

pub struct QueueReceiver<T> {
    inner: channel::Receiver<T>,
    cancel: CancelToken,
}

/// Bounded FIFO between the capture thread and the aggregator.
pub fn transport_queue<T>(capacity: usize, cancel: CancelToken) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = channel::bounded(capacity.max(1));
    (
        QueueSender {
            inner: tx,
            cancel: cancel.clone(),
        },
        QueueReceiver { inner: rx, cancel },
    )
}

impl<T> QueueSender<T> {
    /// Blocks while the queue is full. Gives up only on cancellation or a dropped receiver.
    pub fn send(&self, item: T) -> Result<(), SendError<T>> {
        let mut item = item;
        loop {
            match self.inner.send_timeout(item, WAIT_SLICE) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Disconnected(back)) => return Err(SendError::Disconnected(back)),
                Err(SendTimeoutError::Timeout(back)) => {
                    if self.cancel.is_cancelled() {
                        return Err(SendError::Aborted(back));
                    }
                    item = back;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T> QueueReceiver<T> {
    /// Waits for the next item. Items already queued are returned even after cancellation.
    pub fn recv(&self) -> Received<T> {
        loop {
            match self.inner.recv_timeout(WAIT_SLICE) {
                Ok(item) => return Received::Item(item),
                Err(RecvTimeoutError::Disconnected) => return Received::Closed,
                Err(RecvTimeoutError::Timeout) => {
                    if self.cancel.is_cancelled() {
                        return Received::Cancelled;
                    }
                }
            }
        }
    }

    pub fn try_recv(&self) -> Option<T> {
        match self.inner.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn full_queue_blocks_producer_without_dropping() {
        const K: usize = 3;
        let cancel = CancelToken::new();
        let (tx, rx) = transport_queue::<usize>(K, cancel);
        let producer = thread::spawn(move || {
            for i in 0..=K {
                tx.send(i).unwrap();
            }
            Instant::now()
        });
        thread::sleep(Duration::from_millis(150));
        // the (K+1)-th item is still waiting for room
        assert_eq!(rx.len(), K);
        assert!(!producer.is_finished());

        let mut seen = Vec::new();
        while seen.len() < K + 1 {
            match rx.recv() {
                Received::Item(v) => seen.push(v),
                other => panic!("unexpected {other:?}"),
            }
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..=K).collect::<Vec<_>>());
    }

    #[test]
    fn ordering_survives_a_slow_consumer() {
        let cancel = CancelToken::new();
        let (tx, rx) = transport_queue::<u32>(2, cancel);
        let producer = thread::spawn(move || {
            for i in 0..200 {
                tx.send(i).unwrap();
            }
        });
        let mut seen = Vec::new();
        loop {
            match rx.recv() {
                Received::Item(v) => {
                    if v % 50 == 0 {
                        thread::sleep(Duration::from_millis(5));
                    }
                    seen.push(v)
                }
                Received::Closed => break,
                Received::Cancelled => panic!("not cancelled"),
            }
        }
        producer.join().unwrap();
        assert_eq!(seen, (0..200).collect::<Vec<_>>());
    }

    #[test]
    fn cancellation_wakes_both_ends() {
        let cancel = CancelToken::new();
        let (tx, rx) = transport_queue::<u8>(1, cancel.clone());
        tx.send(1).unwrap();
        cancel.cancel();
        assert_eq!(tx.send(2), Err(SendError::Aborted(2)));
        assert_eq!(rx.recv(), Received::Item(1));
        assert_eq!(rx.recv(), Received::Cancelled);
        assert!(!cancel.has_failed());
    }

    #[test]
    fn fail_also_cancels() {
        let cancel = CancelToken::new();
        let observer = cancel.clone();
        cancel.fail();
        assert!(observer.is_cancelled() && observer.has_failed());
    }
}
