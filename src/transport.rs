//! Point-to-point message transport between process slots.
//!
//! Every process owns an [`Endpoint`]: a sender handle to every peer plus a
//! single inbox. Receives are blocking and tag-selective; messages that
//! arrive under a different tag are parked in a per-source pending queue
//! until someone asks for them, which preserves FIFO order within each
//! (source, tag) pair. [`Endpoint::probe`] is the only non-blocking arrival
//! check and never consumes a message.

use std::cell::RefCell;
use std::collections::VecDeque;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::{Result, SkeletonError};
use crate::serialize::Payload;

pub type ProcessId = usize;

/// The closed set of message tags. Every tag appears in exactly one arc of
/// the solver and collective state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Ordinary user payloads travelling between stages.
    Data,
    Stop,
    TerminationTest,
    /// A branch-and-bound problem moving between solvers for load balancing.
    Problem,
    Solution,
    Subproblem,
    WorkRequest,
    Rejection,
    SendRequest,
    ReadySignal,
    Incumbent,
    IncumbentSendRequest,
    IncumbentReadySignal,
    LowerBoundHint,
    HintRejection,
    ProblemSendRequest,
    ProblemReadySignal,
    ProblemSolved,
    Statistics,
    Allgather,
    Allreduce,
    Broadcast,
    Rotate,
}

struct WireMessage {
    src: ProcessId,
    tag: Tag,
    count: usize,
    bytes: Box<[u8]>,
}

/// Metadata of a pending message, as reported by `probe`.
#[derive(Debug, Clone, Copy)]
pub struct Envelope {
    pub src: ProcessId,
    pub tag: Tag,
    pub count: usize,
    pub len: usize,
}

pub struct Endpoint {
    id: ProcessId,
    peers: Vec<Sender<WireMessage>>,
    inbox: Receiver<WireMessage>,
    /// Arrived but not yet consumed messages, per source.
    pending: RefCell<Vec<VecDeque<WireMessage>>>,
}

impl Endpoint {
    /// Builds the full mesh of endpoints for `np` processes.
    pub fn full_mesh(np: usize) -> Vec<Endpoint> {
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..np).map(|_| unbounded()).unzip();

        rxs.into_iter()
            .enumerate()
            .map(|(id, inbox)| Endpoint {
                id,
                peers: txs.clone(),
                inbox,
                pending: RefCell::new((0..np).map(|_| VecDeque::new()).collect()),
            })
            .collect()
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Moves everything sitting in the inbox into the pending queues.
    fn pump(&self) {
        let mut pending = self.pending.borrow_mut();
        while let Ok(msg) = self.inbox.try_recv() {
            pending[msg.src].push_back(msg);
        }
    }

    fn take_pending(&self, src: ProcessId, tag: Option<Tag>) -> Option<WireMessage> {
        let mut pending = self.pending.borrow_mut();
        let queue = &mut pending[src];
        let at = queue
            .iter()
            .position(|m| tag.map_or(true, |t| m.tag == t))?;
        queue.remove(at)
    }

    fn send_raw(&self, dst: ProcessId, tag: Tag, count: usize, bytes: Box<[u8]>) -> Result<()> {
        let sender = self.peers.get(dst).ok_or(SkeletonError::UndefinedPeer {
            process: self.id,
            peer: dst,
        })?;

        sender
            .send(WireMessage {
                src: self.id,
                tag,
                count,
                bytes,
            })
            .map_err(|_| SkeletonError::PeerClosed {
                process: self.id,
                peer: dst,
            })
    }

    fn receive_raw(&self, src: ProcessId, tag: Tag) -> Result<WireMessage> {
        if src >= self.peers.len() {
            return Err(SkeletonError::UndefinedPeer {
                process: self.id,
                peer: src,
            });
        }

        loop {
            if let Some(msg) = self.take_pending(src, Some(tag)) {
                return Ok(msg);
            }

            match self.inbox.recv() {
                Ok(msg) => self.pending.borrow_mut()[msg.src].push_back(msg),
                Err(_) => {
                    return Err(SkeletonError::PeerClosed {
                        process: self.id,
                        peer: src,
                    })
                }
            }
        }
    }

    /// Blocking send of a single value.
    pub fn send<T: Payload>(&self, dst: ProcessId, value: &T, tag: Tag) -> Result<()> {
        self.send_slice(dst, std::slice::from_ref(value), tag)
    }

    /// Blocking send of a homogeneous slice. All values must serialize to
    /// the same size; the first element's size is authoritative.
    pub fn send_slice<T: Payload>(&self, dst: ProcessId, values: &[T], tag: Tag) -> Result<()> {
        let each = values.first().map_or(0, Payload::size);
        let mut bytes = vec![0u8; each * values.len()];

        for (i, value) in values.iter().enumerate() {
            value.reduce(&mut bytes[i * each..(i + 1) * each]);
        }

        self.send_raw(dst, tag, values.len(), bytes.into_boxed_slice())
    }

    /// Blocking receive of a single value with a matching tag from `src`.
    pub fn receive<T: Payload>(&self, src: ProcessId, tag: Tag) -> Result<T> {
        let msg = self.receive_raw(src, tag)?;
        Ok(T::expand(&msg.bytes))
    }

    /// Blocking receive into a caller-sized buffer; `out.len()` determines
    /// the expected element count.
    pub fn receive_into<T: Payload>(&self, src: ProcessId, tag: Tag, out: &mut [T]) -> Result<()> {
        let msg = self.receive_raw(src, tag)?;
        let each = if out.is_empty() {
            0
        } else {
            msg.bytes.len() / out.len()
        };

        for (i, slot) in out.iter_mut().enumerate() {
            *slot = T::expand(&msg.bytes[i * each..(i + 1) * each]);
        }

        Ok(())
    }

    /// Blocking receive of however many elements the sender shipped.
    pub fn receive_vec<T: Payload>(&self, src: ProcessId, tag: Tag) -> Result<Vec<T>> {
        let msg = self.receive_raw(src, tag)?;
        let each = if msg.count == 0 {
            0
        } else {
            msg.bytes.len() / msg.count
        };

        Ok((0..msg.count)
            .map(|i| T::expand(&msg.bytes[i * each..(i + 1) * each]))
            .collect())
    }

    /// Sends a zero-payload control message.
    pub fn send_tag(&self, dst: ProcessId, tag: Tag) -> Result<()> {
        self.send_raw(dst, tag, 0, Box::default())
    }

    /// Blocks until a control message with the given tag arrives from `src`.
    pub fn receive_tag(&self, src: ProcessId, tag: Tag) -> Result<()> {
        self.receive_raw(src, tag).map(drop)
    }

    /// Non-blocking check for a pending message with the given tag from
    /// `src`. Does not consume the message.
    pub fn probe(&self, src: ProcessId, tag: Tag) -> Option<Envelope> {
        self.probe_matching(src, Some(tag))
    }

    /// Non-blocking check for any pending message from `src`.
    pub fn probe_from(&self, src: ProcessId) -> Option<Envelope> {
        self.probe_matching(src, None)
    }

    fn probe_matching(&self, src: ProcessId, tag: Option<Tag>) -> Option<Envelope> {
        if src >= self.peers.len() {
            return None;
        }

        self.pump();
        let pending = self.pending.borrow();
        pending[src]
            .iter()
            .find(|m| tag.map_or(true, |t| m.tag == t))
            .map(|m| Envelope {
                src: m.src,
                tag: m.tag,
                count: m.count,
                len: m.bytes.len(),
            })
    }

    /// Paired exchange with one peer: the lower-id side sends first, the
    /// higher-id side receives first, so two processes exchanging with each
    /// other cannot wait on one another in the wrong order.
    pub fn exchange<T: Payload>(&self, peer: ProcessId, value: &T) -> Result<T> {
        if self.id < peer {
            self.send(peer, value, Tag::Data)?;
            self.receive(peer, Tag::Data)
        } else {
            let incoming = self.receive(peer, Tag::Data)?;
            self.send(peer, value, Tag::Data)?;
            Ok(incoming)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_receive_round_trip() {
        let mut mesh = Endpoint::full_mesh(2);
        let b = mesh.pop().unwrap();
        let a = mesh.pop().unwrap();

        a.send(1, &42i64, Tag::Data).unwrap();
        assert_eq!(b.receive::<i64>(0, Tag::Data).unwrap(), 42);
    }

    #[test]
    fn test_tag_selective_receive_preserves_fifo() {
        let mut mesh = Endpoint::full_mesh(2);
        let b = mesh.pop().unwrap();
        let a = mesh.pop().unwrap();

        a.send(1, &1i32, Tag::Data).unwrap();
        a.send(1, &2i32, Tag::Solution).unwrap();
        a.send(1, &3i32, Tag::Data).unwrap();

        // The Solution message does not disturb Data ordering.
        assert_eq!(b.receive::<i32>(0, Tag::Data).unwrap(), 1);
        assert_eq!(b.receive::<i32>(0, Tag::Data).unwrap(), 3);
        assert_eq!(b.receive::<i32>(0, Tag::Solution).unwrap(), 2);
    }

    #[test]
    fn test_probe_does_not_consume() {
        let mut mesh = Endpoint::full_mesh(2);
        let b = mesh.pop().unwrap();
        let a = mesh.pop().unwrap();

        assert!(b.probe(0, Tag::Stop).is_none());
        a.send_tag(1, Tag::Stop).unwrap();

        // Wait for delivery; the channel is asynchronous but local.
        while b.probe(0, Tag::Stop).is_none() {
            std::thread::yield_now();
        }

        assert!(b.probe(0, Tag::Stop).is_some());
        b.receive_tag(0, Tag::Stop).unwrap();
        assert!(b.probe(0, Tag::Stop).is_none());
    }

    #[test]
    fn test_undefined_peer_is_an_error() {
        let mut mesh = Endpoint::full_mesh(1);
        let a = mesh.pop().unwrap();

        assert!(matches!(
            a.send(5, &0i32, Tag::Data),
            Err(SkeletonError::UndefinedPeer { peer: 5, .. })
        ));
    }

    #[test]
    fn test_slice_round_trip() {
        let mut mesh = Endpoint::full_mesh(2);
        let b = mesh.pop().unwrap();
        let a = mesh.pop().unwrap();

        a.send_slice(1, &[1.5f64, -2.5, 99.0], Tag::Allgather).unwrap();
        let got: Vec<f64> = b.receive_vec(0, Tag::Allgather).unwrap();
        assert_eq!(got, vec![1.5, -2.5, 99.0]);
    }
}
