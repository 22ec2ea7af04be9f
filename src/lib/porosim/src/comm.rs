//! Rank-to-rank communication behind the partition and the collective
//! reductions of the nonlinear loop.
//!
//! The solve core only ever needs a handful of operations: min/max/sum
//! reductions for convergence tests and time-step selection, an inclusive
//! scan for global row numbering, and paired point-to-point exchanges for
//! halo data. All ranks execute the same sequence of collectives in the same
//! order; the transport below is trusted to be reliable, mirroring the MPI
//! contract. `SerialComm` is the single-process implementation; `ChannelComm`
//! runs one thread per rank over crossbeam channels so multi-rank behaviour
//! is exercised in tests without an MPI runtime.

use crossbeam_channel::{Receiver, Sender, unbounded};

pub trait Communicator: Send {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn allreduce_min_f64(&self, x: f64) -> f64;
    fn allreduce_max_f64(&self, x: f64) -> f64;
    fn allreduce_sum_f64(&self, x: f64) -> f64;
    fn allreduce_min_i32(&self, x: i32) -> i32;

    /// Inclusive prefix sum in rank order.
    fn scan_sum(&self, x: u64) -> u64;

    /// Non-blocking post of a buffer to `peer`. The matching `recv_*` on the
    /// peer side completes the transfer. Halo exchanges post every send
    /// before draining any receive, so a send must never block.
    fn send_f64(&self, peer: usize, buf: &[f64]);
    fn send_i32(&self, peer: usize, buf: &[i32]);
    fn send_u64(&self, peer: usize, buf: &[u64]);

    /// Blocking receive of the next buffer sent by `peer`.
    fn recv_f64(&self, peer: usize) -> Vec<f64>;
    fn recv_i32(&self, peer: usize) -> Vec<i32>;
    fn recv_u64(&self, peer: usize) -> Vec<u64>;
}

/// Single-rank communicator. Reductions are the identity; there are no
/// peers, so a point-to-point exchange is a programmer error.
#[derive(Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn allreduce_min_f64(&self, x: f64) -> f64 {
        x
    }
    fn allreduce_max_f64(&self, x: f64) -> f64 {
        x
    }
    fn allreduce_sum_f64(&self, x: f64) -> f64 {
        x
    }
    fn allreduce_min_i32(&self, x: i32) -> i32 {
        x
    }
    fn scan_sum(&self, x: u64) -> u64 {
        x
    }
    fn send_f64(&self, peer: usize, _buf: &[f64]) {
        unreachable!("serial communicator has no peer {peer}")
    }
    fn send_i32(&self, peer: usize, _buf: &[i32]) {
        unreachable!("serial communicator has no peer {peer}")
    }
    fn send_u64(&self, peer: usize, _buf: &[u64]) {
        unreachable!("serial communicator has no peer {peer}")
    }
    fn recv_f64(&self, peer: usize) -> Vec<f64> {
        unreachable!("serial communicator has no peer {peer}")
    }
    fn recv_i32(&self, peer: usize) -> Vec<i32> {
        unreachable!("serial communicator has no peer {peer}")
    }
    fn recv_u64(&self, peer: usize) -> Vec<u64> {
        unreachable!("serial communicator has no peer {peer}")
    }
}

enum Packet {
    F64(Vec<f64>),
    I32(Vec<i32>),
    U64(Vec<u64>),
}

/// In-process communicator: one instance per rank thread, a dedicated FIFO
/// channel per ordered rank pair. Collectives gather to rank 0 and fan the
/// result back out, which preserves the "every rank blocks at the next
/// collective" semantics.
pub struct ChannelComm {
    rank: usize,
    size: usize,
    /// tx[j]: channel from this rank to rank j
    tx: Vec<Sender<Packet>>,
    /// rx[j]: channel from rank j to this rank
    rx: Vec<Receiver<Packet>>,
}

impl ChannelComm {
    /// Build a fully connected group of `size` communicators, one per rank.
    pub fn group(size: usize) -> Vec<ChannelComm> {
        let mut senders: Vec<Vec<Sender<Packet>>> = Vec::with_capacity(size);
        let mut receivers: Vec<Vec<Receiver<Packet>>> = (0..size).map(|_| Vec::new()).collect();
        for _i in 0..size {
            let mut row = Vec::with_capacity(size);
            for j in 0..size {
                let (s, r) = unbounded();
                row.push(s);
                receivers[j].push(r);
            }
            senders.push(row);
        }
        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (tx, rx))| ChannelComm { rank, size, tx, rx })
            .collect()
    }

    fn send(&self, peer: usize, p: Packet) {
        self.tx[peer].send(p).expect("peer rank hung up");
    }

    fn allreduce_f64(&self, x: f64, op: fn(f64, f64) -> f64) -> f64 {
        if self.size == 1 {
            return x;
        }
        if self.rank == 0 {
            let mut acc = x;
            for j in 1..self.size {
                acc = op(acc, self.recv_f64(j)[0]);
            }
            for j in 1..self.size {
                self.send(j, Packet::F64(vec![acc]));
            }
            acc
        } else {
            self.send(0, Packet::F64(vec![x]));
            self.recv_f64(0)[0]
        }
    }
}

impl Communicator for ChannelComm {
    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }

    fn allreduce_min_f64(&self, x: f64) -> f64 {
        self.allreduce_f64(x, f64::min)
    }
    fn allreduce_max_f64(&self, x: f64) -> f64 {
        self.allreduce_f64(x, f64::max)
    }
    fn allreduce_sum_f64(&self, x: f64) -> f64 {
        self.allreduce_f64(x, |a, b| a + b)
    }

    fn allreduce_min_i32(&self, x: i32) -> i32 {
        if self.size == 1 {
            return x;
        }
        if self.rank == 0 {
            let mut acc = x;
            for j in 1..self.size {
                acc = acc.min(self.recv_i32(j)[0]);
            }
            for j in 1..self.size {
                self.send(j, Packet::I32(vec![acc]));
            }
            acc
        } else {
            self.send(0, Packet::I32(vec![x]));
            self.recv_i32(0)[0]
        }
    }

    fn scan_sum(&self, x: u64) -> u64 {
        if self.size == 1 {
            return x;
        }
        if self.rank == 0 {
            let mut vals = vec![x];
            for j in 1..self.size {
                vals.push(self.recv_u64(j)[0]);
            }
            let mut acc = 0u64;
            let prefix: Vec<u64> = vals
                .iter()
                .map(|v| {
                    acc += v;
                    acc
                })
                .collect();
            for j in 1..self.size {
                self.send(j, Packet::U64(vec![prefix[j]]));
            }
            prefix[0]
        } else {
            self.send(0, Packet::U64(vec![x]));
            self.recv_u64(0)[0]
        }
    }

    fn send_f64(&self, peer: usize, buf: &[f64]) {
        self.send(peer, Packet::F64(buf.to_vec()));
    }
    fn send_i32(&self, peer: usize, buf: &[i32]) {
        self.send(peer, Packet::I32(buf.to_vec()));
    }
    fn send_u64(&self, peer: usize, buf: &[u64]) {
        self.send(peer, Packet::U64(buf.to_vec()));
    }

    fn recv_f64(&self, peer: usize) -> Vec<f64> {
        match self.rx[peer].recv().expect("peer rank hung up") {
            Packet::F64(v) => v,
            _ => unreachable!("collective sequence out of order with rank {peer}"),
        }
    }
    fn recv_i32(&self, peer: usize) -> Vec<i32> {
        match self.rx[peer].recv().expect("peer rank hung up") {
            Packet::I32(v) => v,
            _ => unreachable!("collective sequence out of order with rank {peer}"),
        }
    }
    fn recv_u64(&self, peer: usize) -> Vec<u64> {
        match self.rx[peer].recv().expect("peer rank hung up") {
            Packet::U64(v) => v,
            _ => unreachable!("collective sequence out of order with rank {peer}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn on_ranks<F>(size: usize, f: F) -> Vec<f64>
    where
        F: Fn(&ChannelComm) -> f64 + Sync,
    {
        let comms = ChannelComm::group(size);
        thread::scope(|s| {
            let handles: Vec<_> = comms.iter().map(|c| s.spawn(|| f(c))).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn allreduce_min_is_global() {
        let out = on_ranks(4, |c| c.allreduce_min_f64(10.0 - c.rank() as f64));
        assert!(out.iter().all(|&v| v == 7.0));
    }

    #[test]
    fn scan_sum_is_inclusive_in_rank_order() {
        let comms = ChannelComm::group(3);
        let out: Vec<u64> = thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|c| s.spawn(|| c.scan_sum((c.rank() as u64 + 1) * 10)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(out, vec![10, 30, 60]);
    }

    #[test]
    fn posted_sends_then_recvs_swap_buffers() {
        let out = on_ranks(2, |c| {
            let peer = 1 - c.rank();
            c.send_f64(peer, &[c.rank() as f64 + 1.0]);
            c.recv_f64(peer)[0]
        });
        assert_eq!(out, vec![2.0, 1.0]);
    }
}
