// rust/trainer-core/src/distributed.rs

//! Collective operations between training processes.
//!
//! Every rank runs the same loop; the only communication this crate needs
//! is a named barrier and a logical-OR reduction, both modelled as explicit
//! message exchanges so that ranks may live on different machines.

use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};

use crate::error::{Result, TrainerError};

/// The process group a rank belongs to.
pub trait ProcessGroup: Send + Sync {
    /// This process's rank, `0..world_size`.
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Whether this rank performs filesystem writes. Rank 0 by default.
    fn is_primary(&self) -> bool {
        self.rank() == 0
    }

    /// Blocks until every rank has reached the barrier with the same name.
    fn barrier(&self, name: &str) -> Result<()>;

    /// Returns true on every rank if `local` is true on any rank.
    fn logical_or(&self, local: bool) -> Result<bool>;

    /// Releases cached accelerator memory. Best effort, no-op by default.
    fn empty_device_cache(&self) {}
}

/// A group of one: collectives return immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn logical_or(&self, local: bool) -> Result<bool> {
        Ok(local)
    }
}

#[derive(Debug, Clone)]
struct Message {
    operation: String,
    value: bool,
}

/// In-process ranks connected by one channel per ordered pair of ranks.
///
/// Used to run several training loops on threads of a single process, and
/// to exercise distributed behaviour in tests. Per-pair FIFO channels keep
/// successive collectives from interleaving.
pub struct LocalGroup {
    rank: usize,
    world_size: usize,
    outgoing: Vec<Option<Sender<Message>>>,
    incoming: Vec<Option<Receiver<Message>>>,
    timeout: Duration,
}

impl LocalGroup {
    /// Default time a rank waits for its peers before failing a collective.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// Creates `world_size` connected ranks, returned in rank order.
    pub fn create(world_size: usize) -> Vec<LocalGroup> {
        Self::with_timeout(world_size, Self::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(world_size: usize, timeout: Duration) -> Vec<LocalGroup> {
        let mut outgoing: Vec<Vec<Option<Sender<Message>>>> =
            (0..world_size).map(|_| vec![None; world_size]).collect();
        let mut incoming: Vec<Vec<Option<Receiver<Message>>>> =
            (0..world_size).map(|_| vec![None; world_size]).collect();

        for from in 0..world_size {
            for to in 0..world_size {
                if from != to {
                    let (tx, rx) = channel::unbounded();
                    outgoing[from][to] = Some(tx);
                    incoming[to][from] = Some(rx);
                }
            }
        }

        outgoing
            .into_iter()
            .zip(incoming)
            .enumerate()
            .map(|(rank, (outgoing, incoming))| LocalGroup {
                rank,
                world_size,
                outgoing,
                incoming,
                timeout,
            })
            .collect()
    }

    /// Sends `value` to every peer and returns the values received from
    /// them, after checking that all peers entered the same operation.
    fn exchange(&self, operation: &str, value: bool) -> Result<Vec<bool>> {
        for (peer, sender) in self.outgoing.iter().enumerate() {
            if let Some(sender) = sender {
                sender
                    .send(Message {
                        operation: operation.to_string(),
                        value,
                    })
                    .map_err(|_| {
                        TrainerError::collective(operation, self.rank, format!("rank {peer} has left the group"))
                    })?;
            }
        }

        let mut values = Vec::with_capacity(self.world_size.saturating_sub(1));
        for (peer, receiver) in self.incoming.iter().enumerate() {
            let Some(receiver) = receiver else { continue };
            let message = receiver.recv_timeout(self.timeout).map_err(|e| {
                let reason = match e {
                    RecvTimeoutError::Timeout => format!("timed out waiting for rank {peer}"),
                    RecvTimeoutError::Disconnected => format!("rank {peer} has left the group"),
                };
                TrainerError::collective(operation, self.rank, reason)
            })?;
            if message.operation != operation {
                return Err(TrainerError::collective(
                    operation,
                    self.rank,
                    format!("rank {peer} entered '{}' instead", message.operation),
                ));
            }
            values.push(message.value);
        }
        Ok(values)
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self, name: &str) -> Result<()> {
        self.exchange(&format!("barrier:{name}"), true).map(|_| ())
    }

    fn logical_or(&self, local: bool) -> Result<bool> {
        let peers = self.exchange("logical_or", local)?;
        Ok(local || peers.into_iter().any(|v| v))
    }
}
