//! In-memory packet queues backing the stack's network interface.
//!
//! The interface never touches a file descriptor directly: frames arriving
//! from the link (TUN or the loopback hairpin) are pushed onto the receive
//! queue after passing the flow gate, and frames the stack emits accumulate
//! on the transmit queue until the driver loop hands them to the link.

use std::collections::VecDeque;

use smoltcp::{
    phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken},
    time::Instant,
};

pub(crate) struct QueueDevice {
    rx: VecDeque<Vec<u8>>,
    tx: VecDeque<Vec<u8>>,
    mtu: usize,
    tx_queue_len: usize,
}

impl QueueDevice {
    pub(crate) fn new(mtu: usize, tx_queue_len: usize) -> Self {
        Self { rx: VecDeque::new(), tx: VecDeque::new(), mtu, tx_queue_len }
    }

    /// Queue an inbound frame for the next interface poll.
    pub(crate) fn enqueue_rx(&mut self, frame: Vec<u8>) {
        self.rx.push_back(frame);
    }

    /// Queue an outbound frame as if the stack had emitted it.
    pub(crate) fn enqueue_tx(&mut self, frame: Vec<u8>) {
        self.tx.push_back(frame);
    }

    /// Take every frame the stack has emitted since the last drain.
    pub(crate) fn drain_tx(&mut self) -> Vec<Vec<u8>> {
        self.tx.drain(..).collect()
    }
}

pub(crate) struct QueueRxToken(Vec<u8>);

impl RxToken for QueueRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.0)
    }
}

pub(crate) struct QueueTxToken<'a>(&'a mut VecDeque<Vec<u8>>);

impl TxToken for QueueTxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len];
        let result = f(&mut frame);
        self.0.push_back(frame);
        result
    }
}

impl Device for QueueDevice {
    type RxToken<'a>
        = QueueRxToken
    where
        Self: 'a;
    type TxToken<'a>
        = QueueTxToken<'a>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.pop_front()?;
        Some((QueueRxToken(frame), QueueTxToken(&mut self.tx)))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        if self.tx.len() >= self.tx_queue_len {
            return None;
        }
        Some(QueueTxToken(&mut self.tx))
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}
