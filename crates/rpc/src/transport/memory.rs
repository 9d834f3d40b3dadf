//! In-process carrier backed by tokio channels.
//!
//! Stands in for a message-queue client: each end pushes payloads onto the
//! other end's queue. Useful for tests and for running a client and server
//! in one process.

use std::sync::Mutex;

use tokio::sync::mpsc;

use super::{Carrier, CarrierFuture, CarrierReceiver, CarrierSender, Delivery, TransportError};

/// Capacity of each direction's queue.
pub const MEMORY_QUEUE_CAPACITY: usize = 1024;

/// One end of an in-process carrier pair.
pub struct MemoryCarrier {
    delivery: Delivery,
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl MemoryCarrier {
    /// A connected pair of duplex carriers.
    pub fn pair() -> (Self, Self) {
        Self::pair_with(Delivery::Duplex)
    }

    /// A connected pair that reports one-shot delivery.
    ///
    /// Channels over it skip the handshake and verify every payload against
    /// the trust policy.
    pub fn one_shot_pair() -> (Self, Self) {
        Self::pair_with(Delivery::OneShot)
    }

    fn pair_with(delivery: Delivery) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(MEMORY_QUEUE_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(MEMORY_QUEUE_CAPACITY);
        (
            Self {
                delivery,
                tx: a_tx,
                rx: a_rx,
            },
            Self {
                delivery,
                tx: b_tx,
                rx: b_rx,
            },
        )
    }
}

impl Carrier for MemoryCarrier {
    fn delivery(&self) -> Delivery {
        self.delivery
    }

    fn split(self: Box<Self>) -> (Box<dyn CarrierSender>, Box<dyn CarrierReceiver>) {
        (
            Box::new(MemorySender {
                tx: Mutex::new(Some(self.tx)),
            }),
            Box::new(MemoryReceiver { rx: self.rx }),
        )
    }
}

struct MemorySender {
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl MemorySender {
    fn handle(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl CarrierSender for MemorySender {
    fn send<'a>(&'a self, payload: Vec<u8>) -> CarrierFuture<'a, ()> {
        Box::pin(async move {
            let tx = self.handle().ok_or(TransportError::Closed)?;
            tx.send(payload).await.map_err(|_| TransportError::Closed)
        })
    }

    fn close<'a>(&'a self) -> CarrierFuture<'a, ()> {
        Box::pin(async move {
            // Dropping the sender ends the peer's stream
            self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
            Ok(())
        })
    }
}

struct MemoryReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl CarrierReceiver for MemoryReceiver {
    fn recv<'a>(&'a mut self) -> CarrierFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move { Ok(self.rx.recv().await) })
    }
}
