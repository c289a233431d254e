use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::{WorkerError, WorkerResult};

/// The distributed worker's tagged message set (see the role table this
/// mirrors: READY_WORKER, RECV_WORK, RESULTS_WORKER, STOP_WORK,
/// KILLED_WORKER).
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ReadyWorker,
    RecvWork { cmd: String, id: String },
    ResultsWorker { status: i32, id: String },
    StopWork,
    KilledWorker,
}

/// An abstract point-to-point channel with tagged messages and named
/// sources, standing in for whatever real transport (MPI, a socket pool, a
/// job-queue broker) a deployment plugs in. Nothing in this crate depends
/// on a concrete transport beyond this trait.
pub trait Channel {
    fn send(&self, dest: usize, msg: Message) -> WorkerResult<()>;
    fn recv_any(&self) -> WorkerResult<(usize, Message)>;
    fn recv_from(&self, source: usize) -> WorkerResult<Message>;
    /// Non-blocking-ish receive bounded by a short internal poll interval;
    /// used by the master's admit/drain loops, which must also watch the
    /// clock and the interrupt flag.
    fn try_recv_any(&self) -> WorkerResult<Option<(usize, Message)>>;
}

/// One endpoint of an in-process `mpsc`-backed network, useful for driving
/// master/worker interactions in tests without any real transport.
pub struct MpscEndpoint {
    rank: usize,
    senders: HashMap<usize, Sender<(usize, Message)>>,
    receiver: Receiver<(usize, Message)>,
}

pub fn mpsc_network(size: usize) -> Vec<MpscEndpoint> {
    let mut txs = Vec::with_capacity(size);
    let mut rxs = Vec::with_capacity(size);
    for _ in 0..size {
        let (tx, rx) = channel();
        txs.push(tx);
        rxs.push(rx);
    }
    rxs.into_iter()
        .enumerate()
        .map(|(rank, receiver)| {
            let senders = (0..size)
                .filter(|&r| r != rank)
                .map(|r| (r, txs[r].clone()))
                .collect();
            MpscEndpoint { rank, senders, receiver }
        })
        .collect()
}

impl Channel for MpscEndpoint {
    fn send(&self, dest: usize, msg: Message) -> WorkerResult<()> {
        self.senders
            .get(&dest)
            .ok_or_else(|| WorkerError::InvalidArgument(format!("no peer at rank {dest}")))?
            .send((self.rank, msg))
            .map_err(|_| WorkerError::InvalidArgument("peer channel closed".into()))
    }

    fn recv_any(&self) -> WorkerResult<(usize, Message)> {
        self.receiver
            .recv()
            .map_err(|_| WorkerError::InvalidArgument("channel closed".into()))
    }

    fn recv_from(&self, source: usize) -> WorkerResult<Message> {
        loop {
            let (from, msg) = self.recv_any()?;
            if from == source {
                return Ok(msg);
            }
        }
    }

    fn try_recv_any(&self) -> WorkerResult<Option<(usize, Message)>> {
        match self.receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(v) => Ok(Some(v)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(WorkerError::InvalidArgument("channel closed".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_endpoints_exchange_messages() {
        let mut net = mpsc_network(2);
        let worker = net.pop().unwrap();
        let master = net.pop().unwrap();

        worker.send(0, Message::ReadyWorker).unwrap();
        let (from, msg) = master.recv_any().unwrap();
        assert_eq!(from, 1);
        assert_eq!(msg, Message::ReadyWorker);

        master
            .send(
                1,
                Message::RecvWork {
                    cmd: "echo hi".into(),
                    id: "t1".into(),
                },
            )
            .unwrap();
        let msg = worker.recv_from(0).unwrap();
        assert_eq!(
            msg,
            Message::RecvWork {
                cmd: "echo hi".into(),
                id: "t1".into()
            }
        );
    }

    #[test]
    fn try_recv_any_times_out_without_blocking_forever() {
        let net = mpsc_network(1);
        assert_eq!(net[0].try_recv_any().unwrap(), None);
    }
}
