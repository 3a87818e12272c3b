//! Frame-level I/O over a raw link: encode-and-write outbound frames,
//! reassemble inbound notification chunks, hand out whole frames under a
//! deadline.
//!
//! There is exactly one consumer of the notification stream, so buffered
//! frames preserve FIFO order until someone asks for them.

use crate::error::{BridgeError, BridgeResult};
use crate::frame::{Frame, Framer};
use keybridge_link::{BleLink, WriteKind};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// A [`BleLink`] paired with the framer and inbound frame queue.
pub struct Wire<L> {
    pub link: L,
    framer: Framer,
    inbox: VecDeque<Frame>,
}

impl<L: BleLink> Wire<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            framer: Framer::new(),
            inbox: VecDeque::new(),
        }
    }

    /// Encode and write a frame.
    pub async fn send(&mut self, frame: &Frame, kind: WriteKind) -> BridgeResult<()> {
        self.link.write(&frame.encode(), kind).await?;
        Ok(())
    }

    /// Next complete frame, waiting up to `timeout`. `what` names the
    /// awaited reply in the timeout error.
    pub async fn recv(&mut self, timeout: Duration, what: &'static str) -> BridgeResult<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.inbox.pop_front() {
                return Ok(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BridgeError::Timeout(what));
            }
            match self.link.next_notification(deadline - now).await {
                Some(chunk) => {
                    for frame in self.framer.push(&chunk) {
                        self.inbox.push_back(frame);
                    }
                }
                None => return Err(BridgeError::Timeout(what)),
            }
        }
    }

    /// Drop buffered frames and partial bytes, e.g. across a reconnect.
    pub fn reset(&mut self) {
        self.framer.clear();
        self.inbox.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::op;
    use crate::sim::{SimDongle, SimDongleConfig, SimLink};

    async fn connected_wire(cfg: SimDongleConfig) -> (Wire<SimLink>, SimDongle) {
        let dongle = SimDongle::new(cfg);
        let mut link = SimLink::new();
        link.add_peer("AA:BB", dongle.clone(), -60, true, None);
        link.connect("AA:BB", None).await.unwrap();
        (Wire::new(link), dongle)
    }

    #[tokio::test]
    async fn timeout_errors_carry_the_awaited_label() {
        let (mut wire, _dongle) = connected_wire(SimDongleConfig {
            suppress_hello: true,
            ..SimDongleConfig::default()
        })
        .await;

        let err = wire
            .recv(Duration::from_millis(10), "server hello")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "timed out waiting for server hello");
    }

    #[tokio::test]
    async fn buffered_frames_come_out_in_arrival_order() {
        let (mut wire, dongle) = connected_wire(SimDongleConfig::default()).await;
        // A second hello queued behind the connect-time one.
        dongle.force_rehello();

        let first = wire.recv(Duration::from_millis(50), "hello").await.unwrap();
        let second = wire.recv(Duration::from_millis(50), "hello").await.unwrap();
        assert_eq!(first.op, op::SERVER_HELLO);
        assert_eq!(second.op, op::SERVER_HELLO);
        // Distinct session offers, preserved in FIFO order.
        assert_ne!(first.payload, second.payload);
    }
}
