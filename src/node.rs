//! Single-owner actor around a [`Blockchain`].
//!
//! The chain is moved into a tokio task and every mutation arrives over a
//! channel, so accept and decide calls are applied one at a time no matter how
//! many callers hold a [`ChainHandle`]. Mining runs on a blocking worker
//! outside the actor and never holds up other requests.

use crate::blockchain::{Block, BlockStatus, Blockchain, KvStore, Outcome, RequestId, Visibility};
use crate::error::{ChainError, Result};
use crate::miner::mine_with_deadline;
use crate::operation::Operation;
use crate::persistence::Persistence;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const COMMAND_BUFFER: usize = 64;

enum Command {
    Append(Block, oneshot::Sender<()>),
    Accept(Block, usize, oneshot::Sender<Result<Outcome>>),
    Decide(Block, usize, oneshot::Sender<Result<Outcome>>),
    Generate(Visibility, oneshot::Sender<Result<KvStore>>),
    Snapshot(oneshot::Sender<Blockchain>),
    Depth(oneshot::Sender<usize>),
    Tip(oneshot::Sender<Option<Block>>),
    Shutdown(oneshot::Sender<Blockchain>),
}

/// Cloneable client for a running chain actor.
#[derive(Clone)]
pub struct ChainHandle {
    sender: mpsc::Sender<Command>,
}

/// Move `chain` into a new actor task. Decided blocks are saved through `persistence`.
pub fn spawn_chain_actor(
    chain: Blockchain,
    persistence: Box<dyn Persistence>,
) -> (ChainHandle, JoinHandle<()>) {
    let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);
    let task = tokio::spawn(run(chain, persistence, receiver));
    (ChainHandle { sender }, task)
}

async fn run(mut chain: Blockchain, persistence: Box<dyn Persistence>, mut receiver: mpsc::Receiver<Command>) {
    info!("chain actor started with {} blocks (depth {})", chain.len(), chain.depth());

    while let Some(command) = receiver.recv().await {
        match command {
            Command::Append(block, reply) => {
                chain.append(block);
                let _ = reply.send(());
            }
            Command::Accept(block, index, reply) => {
                let _ = reply.send(chain.accept(block, index));
            }
            Command::Decide(block, index, reply) => {
                let _ = reply.send(decide_durably(&mut chain, persistence.as_ref(), block, index));
            }
            Command::Generate(visibility, reply) => {
                let _ = reply.send(chain.generate_with(visibility));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(chain.clone());
            }
            Command::Depth(reply) => {
                let _ = reply.send(chain.depth());
            }
            Command::Tip(reply) => {
                let _ = reply.send(chain.tip().cloned());
            }
            Command::Shutdown(reply) => {
                debug!("chain actor shutting down");
                let _ = reply.send(chain);
                return;
            }
        }
    }
    debug!("all chain handles dropped, actor exiting");
}

/// Apply a decide to a copy of `chain` and keep it only once it is saved.
///
/// A failed save leaves `chain` untouched, so retrying the same decide runs
/// both the state change and the save again.
fn decide_durably(
    chain: &mut Blockchain,
    persistence: &dyn Persistence,
    block: Block,
    index: usize,
) -> Result<Outcome> {
    let mut next = chain.clone();
    let outcome = next.decide(block, index)?;
    if outcome == Outcome::Applied {
        persistence.save_blockchain(&next).map_err(|e| {
            error!("failed to persist chain after decide at {}: {}", index, e);
            e
        })?;
        *chain = next;
    }
    Ok(outcome)
}

impl ChainHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| ChainError::ActorUnavailable)?;
        response.await.map_err(|_| ChainError::ActorUnavailable)
    }

    pub async fn append(&self, block: Block) -> Result<()> {
        self.request(|reply| Command::Append(block, reply)).await
    }

    pub async fn accept(&self, block: Block, index: usize) -> Result<Outcome> {
        self.request(|reply| Command::Accept(block, index, reply)).await?
    }

    pub async fn decide(&self, block: Block, index: usize) -> Result<Outcome> {
        self.request(|reply| Command::Decide(block, index, reply)).await?
    }

    pub async fn generate(&self, visibility: Visibility) -> Result<KvStore> {
        self.request(|reply| Command::Generate(visibility, reply)).await?
    }

    pub async fn snapshot(&self) -> Result<Blockchain> {
        self.request(Command::Snapshot).await
    }

    pub async fn depth(&self) -> Result<usize> {
        self.request(Command::Depth).await
    }

    pub async fn tip(&self) -> Result<Option<Block>> {
        self.request(Command::Tip).await
    }

    /// Stop the actor and hand back the chain it owned.
    pub async fn shutdown(&self) -> Result<Blockchain> {
        self.request(Command::Shutdown).await
    }

    /// Mine a tentative block for `operation` on top of the current tip.
    ///
    /// Returns the block with the slot it was mined for. The slot may have been
    /// taken by the time the caller accepts it, in which case accept fails on
    /// linkage and the caller proposes again.
    pub async fn propose(
        &self,
        operation: Operation,
        request_id: RequestId,
        deadline: Duration,
    ) -> Result<(Block, usize)> {
        let snapshot = self.snapshot().await?;
        let index = snapshot.len();
        let predecessor = snapshot.tip().cloned();
        let (nonce, hash_pointer) =
            mine_with_deadline(operation.clone(), predecessor, *snapshot.difficulty(), deadline).await?;

        let block = Block::from_parts(operation, nonce, hash_pointer, request_id, BlockStatus::Tentative);
        debug!("proposed {} for index {}", block, index);
        Ok((block, index))
    }
}
