//! Endpoint Object Implementation
//!
//! Endpoints are rendezvous points for synchronous IPC. A sender blocks
//! until a receiver takes its frame in the same step (and vice versa);
//! nothing is buffered beyond the transfer in flight.
//!
//! The rendezvous is a zero-capacity channel. A second signal channel is
//! closed when the object is destroyed, which wakes every thread blocked on
//! the endpoint. Each waiter also watches the revocation signal of the
//! capability it waits through.
//!
//! A hand-off carries an acknowledgement channel: the receiver reports
//! whether it accepted the frame, so a sender whose capability died between
//! hand-off and acceptance learns that nothing was delivered.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crossbeam::channel::{after, bounded, never, Receiver, Sender};

use crate::abi::IpcFrame;

/// Why a rendezvous did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RendezvousError {
    Timeout,
    Closed,
    /// The waiting capability was revoked
    Revoked,
}

/// A frame in transit, with the receiver's verdict channel
pub(crate) struct Handoff {
    pub frame: IpcFrame,
    ack: Sender<bool>,
}

impl Handoff {
    /// Report whether the frame was accepted; the sender is waiting on it
    pub fn acknowledge(self, accepted: bool) -> IpcFrame {
        let _ = self.ack.send(accepted);
        self.frame
    }
}

pub(crate) struct Endpoint {
    tx: Sender<Handoff>,
    rx: Receiver<Handoff>,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
}

impl Endpoint {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        let (close_tx, close_rx) = bounded(0);
        Self {
            tx,
            rx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
        }
    }

    /// Wake every blocked thread and refuse future transfers
    pub fn close(&self) {
        self.close_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.close_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Block until a receiver takes `frame`, then until it accepts or drops it
    ///
    /// `revoked` disconnects when the sending capability is revoked. Returns
    /// `Ok(false)` when the receiver took the frame but refused it.
    pub fn send(
        &self,
        frame: IpcFrame,
        timeout: Option<Duration>,
        revoked: &Receiver<()>,
    ) -> Result<bool, RendezvousError> {
        if self.is_closed() {
            return Err(RendezvousError::Closed);
        }
        let deadline = timeout.map(after).unwrap_or_else(never);
        let (ack, verdict) = bounded(1);
        let handoff = Handoff { frame, ack };

        crossbeam::select! {
            send(self.tx, handoff) -> res => res.map_err(|_| RendezvousError::Closed)?,
            recv(self.close_rx) -> _ => return Err(RendezvousError::Closed),
            recv(revoked) -> _ => return Err(RendezvousError::Revoked),
            recv(deadline) -> _ => return Err(RendezvousError::Timeout),
        }
        // The receiver acknowledges right after its checks
        Ok(verdict.recv().unwrap_or(false))
    }

    /// Block until a sender hands over a frame
    pub fn recv(
        &self,
        timeout: Option<Duration>,
        revoked: &Receiver<()>,
    ) -> Result<Handoff, RendezvousError> {
        if self.is_closed() {
            return Err(RendezvousError::Closed);
        }
        let deadline = timeout.map(after).unwrap_or_else(never);

        crossbeam::select! {
            recv(self.rx) -> handoff => handoff.map_err(|_| RendezvousError::Closed),
            recv(self.close_rx) -> _ => Err(RendezvousError::Closed),
            recv(revoked) -> _ => Err(RendezvousError::Revoked),
            recv(deadline) -> _ => Err(RendezvousError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn frame(label: u64) -> IpcFrame {
        IpcFrame::build(label, 1, 1, b"x", &[]).unwrap()
    }

    /// A revocation signal that stays quiet while the sender is kept
    fn live() -> (Sender<()>, Receiver<()>) {
        bounded(0)
    }

    #[test]
    fn send_without_receiver_times_out() {
        let ep = Endpoint::new();
        let (_keep, revoked) = live();
        let start = Instant::now();
        let result = ep.send(frame(1), Some(Duration::from_millis(50)), &revoked);
        assert_eq!(result.unwrap_err(), RendezvousError::Timeout);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn rendezvous_transfers_frame() {
        let ep = Arc::new(Endpoint::new());
        let (_keep, revoked) = live();
        let receiver = {
            let ep = Arc::clone(&ep);
            let revoked = revoked.clone();
            thread::spawn(move || {
                ep.recv(Some(Duration::from_secs(2)), &revoked)
                    .map(|h| h.acknowledge(true))
            })
        };

        assert!(ep.send(frame(42), Some(Duration::from_secs(2)), &revoked).unwrap());
        let got = receiver.join().unwrap().unwrap();
        assert_eq!(got.label(), 42);
    }

    #[test]
    fn refused_frame_is_reported_to_sender() {
        let ep = Arc::new(Endpoint::new());
        let (_keep, revoked) = live();
        let receiver = {
            let ep = Arc::clone(&ep);
            let revoked = revoked.clone();
            thread::spawn(move || {
                ep.recv(Some(Duration::from_secs(2)), &revoked)
                    .map(|h| h.acknowledge(false))
            })
        };

        assert!(!ep.send(frame(7), Some(Duration::from_secs(2)), &revoked).unwrap());
        receiver.join().unwrap().unwrap();
    }

    #[test]
    fn revocation_wakes_blocked_sender() {
        let ep = Arc::new(Endpoint::new());
        let (kill, revoked) = live();
        let sender = {
            let ep = Arc::clone(&ep);
            thread::spawn(move || ep.send(frame(1), None, &revoked))
        };

        thread::sleep(Duration::from_millis(20));
        drop(kill);
        assert_eq!(sender.join().unwrap().unwrap_err(), RendezvousError::Revoked);
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let ep = Arc::new(Endpoint::new());
        let (_keep, revoked) = live();
        let receiver = {
            let ep = Arc::clone(&ep);
            let revoked = revoked.clone();
            thread::spawn(move || ep.recv(None, &revoked).map(|h| h.acknowledge(true)))
        };

        thread::sleep(Duration::from_millis(20));
        ep.close();
        assert_eq!(receiver.join().unwrap().unwrap_err(), RendezvousError::Closed);
        assert_eq!(ep.send(frame(1), None, &revoked).unwrap_err(), RendezvousError::Closed);
    }
}
