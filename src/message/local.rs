use super::comm::{Communicator, Tag};
use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::error;
use std::cell::{Cell, RefCell};

/// Tag reserved for the abort notice a failing rank sends to its peers.
///
const ABORT: Tag = Tag::MAX;

type Envelope = (usize, Tag, Vec<u8>);




/// A communicator between ranks running as threads of one process. Each rank
/// owns the receiving end of its own channel, and a sender to every peer.
/// Messages that arrive under a tag nobody has asked for yet are parked in
/// a pending list until a matching `recv`.
///
pub struct LocalCommunicator {
    rank: usize,
    peers: Vec<Sender<Envelope>>,
    receiver: Receiver<Envelope>,
    pending: RefCell<Vec<Envelope>>,
    tags: Cell<Tag>,
}




// ============================================================================
impl LocalCommunicator {


    /// Create a fully connected group of communicators, one per rank.
    ///
    pub fn group(size: usize) -> Vec<Self> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| Self {
                rank,
                peers: senders.clone(),
                receiver,
                pending: RefCell::new(Vec::new()),
                tags: Cell::new(0),
            })
            .collect()
    }


    /// Tell every peer that this rank has failed, so that peers blocked in a
    /// receive return an error instead of waiting forever.
    ///
    pub fn abort(&self) {
        for (rank, peer) in self.peers.iter().enumerate() {
            if rank != self.rank {
                peer.send((self.rank, ABORT, Vec::new())).ok();
            }
        }
    }


    fn take_pending(&self, tag: Tag) -> Option<Envelope> {
        let mut pending = self.pending.borrow_mut();
        let n = pending.iter().position(|(_, t, _)| *t == tag || *t == ABORT)?;
        Some(pending.remove(n))
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, tag: Tag, message: Vec<u8>) -> Result<()> {
        self.peers[rank]
            .send((self.rank, tag, message))
            .map_err(|_| Error::Communication(format!("rank {} is gone", rank)))
    }

    fn recv(&self, tag: Tag) -> Result<Vec<u8>> {
        let envelope = match self.take_pending(tag) {
            Some(envelope) => envelope,
            None => loop {
                let envelope = self
                    .receiver
                    .recv()
                    .map_err(|e| Error::Communication(e.to_string()))?;

                if envelope.1 == tag || envelope.1 == ABORT {
                    break envelope;
                }
                self.pending.borrow_mut().push(envelope)
            },
        };
        match envelope {
            (source, ABORT, _) => {
                error!("rank {} received an abort notice from rank {}", self.rank, source);
                Err(Error::Communication(format!("rank {} aborted", source)))
            }
            (_, _, message) => Ok(message),
        }
    }

    fn next_tag(&self) -> Tag {
        let tag = self.tags.get();
        self.tags.set(tag + 1);
        tag
    }
}

impl Drop for LocalCommunicator {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.abort()
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::LocalCommunicator;
    use crate::error::Result;
    use crate::message::comm::Communicator;
    use std::thread;

    fn add(a: Vec<u8>, b: Vec<u8>) -> Result<Vec<u8>> {
        Ok(vec![a[0] + b[0]])
    }

    #[test]
    fn messages_are_matched_by_tag() {
        let mut comms = LocalCommunicator::group(2);
        let b = comms.pop().unwrap();
        let a = comms.pop().unwrap();
        a.send(1, 7, vec![7]).unwrap();
        a.send(1, 3, vec![3]).unwrap();
        assert_eq!(b.recv(3).unwrap(), vec![3]);
        assert_eq!(b.recv(7).unwrap(), vec![7]);
    }

    #[test]
    fn all_reduce_sums_over_every_group_size() {
        for size in 1..=7 {
            let handles: Vec<_> = LocalCommunicator::group(size)
                .into_iter()
                .map(|comm| thread::spawn(move || {
                    let first = comm.all_reduce(&add, vec![comm.rank() as u8]).unwrap();
                    let second = comm.all_reduce(&add, vec![1]).unwrap();
                    (first[0], second[0])
                }))
                .collect();

            let expected = (0..size).sum::<usize>() as u8;
            for handle in handles {
                assert_eq!(handle.join().unwrap(), (expected, size as u8));
            }
        }
    }

    #[test]
    fn an_aborted_peer_fails_the_receive() {
        let mut comms = LocalCommunicator::group(2);
        let b = comms.pop().unwrap();
        let a = comms.pop().unwrap();
        a.abort();
        assert!(b.recv(0).is_err());
    }
}
