use super::util;
use crate::error::Result;

/// Message tags. Every message is sent under a tag, and a receive names the
/// tag it is waiting for; messages under other tags are held until asked for.
///
pub type Tag = u64;

/// A binary combiner used by the reductions.
///
pub type Combine<'a> = &'a dyn Fn(Vec<u8>, Vec<u8>) -> Result<Vec<u8>>;

/// Interface for a group of processing elements that can exchange messages.
/// The underlying transport can in principle be in-process channels, TCP,
/// or a higher level abstraction like MPI.
///
/// Ranks must issue their collective operations in the same order: tags
/// are drawn from a per-rank counter, and the counters only agree if every
/// rank makes the same sequence of `next_tag` calls.
///
pub trait Communicator {
    /// Must be implemented to return the rank of this process within the
    /// communicator.
    fn rank(&self) -> usize;

    /// Must be implemented to return the number of peers processes in this
    /// communicator.
    fn size(&self) -> usize;

    /// Must be implemented to send a message to a peer. This method must
    /// return immediately, in other words it is not allowed to block until a
    /// matching receive is posted.
    fn send(&self, rank: usize, tag: Tag, message: Vec<u8>) -> Result<()>;

    /// Must be implemented to receive a message with the given tag from any
    /// of the peers. This method is allowed to block until such a message is
    /// ready to be received. It fails if a peer has aborted.
    fn recv(&self, tag: Tag) -> Result<Vec<u8>>;

    /// Must be implemented to return a fresh tag. The sequence of tags
    /// returned must be the same on every rank.
    fn next_tag(&self) -> Tag;

    /// Implements a binomial tree broadcast from the root node. The message
    /// buffer must be `Some` if this is the root node, and it must be `None`
    /// otherwise.
    ///
    fn broadcast(&self, tag: Tag, value: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let r = self.rank();
        let p = self.size();

        let value = match value {
            Some(value) => value,
            None => self.recv(tag)?,
        };
        for level in (0..util::ceil_log2(p)).rev() {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 && r + one < p {
                self.send(r + one, tag, value.clone())?
            }
        }
        Ok(value)
    }

    /// Implements a binomial tree reduce. All ranks return `None` except for
    /// the root.
    ///
    fn reduce(&self, tag: Tag, f: Combine, mut value: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let r = self.rank();
        let p = self.size();

        for level in 0..util::ceil_log2(p) {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 {
                if r + one < p {
                    value = f(value, self.recv(tag)?)?
                }
            } else {
                self.send(r - one, tag, value)?;
                return Ok(None);
            }
        }
        Ok(Some(value))
    }

    /// Implements an all-reduce (symmetric fold) operation over a commutative
    /// binary operator.
    ///
    fn all_reduce(&self, f: Combine, value: Vec<u8>) -> Result<Vec<u8>> {
        let up = self.next_tag();
        let down = self.next_tag();
        let reduced = self.reduce(up, f, value)?;
        self.broadcast(down, reduced)
    }
}
