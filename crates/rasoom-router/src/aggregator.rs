//! Micro→Domain batching actor.
//!
//! Reports are grouped by their addressing key and flushed when a group
//! reaches `max_messages` or has been open for `max_wait_ms`, whichever
//! comes first. The actor owns the open batches; everything else talks to it
//! through `Command`s.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::AggregationWindow;
use crate::delivery::DeliveryOutcome;

/// One queued report.
#[derive(Debug)]
pub(crate) struct Pending {
    pub message_id: Uuid,
    pub source_id: String,
    pub frame: Bytes,
    pub queued_at: Instant,
    pub notify: oneshot::Sender<DeliveryOutcome>,
}

/// Reports sharing a key travel in the same batch.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct BatchKey {
    pub agent_id: Option<String>,
    pub cluster_id: Option<String>,
}

#[derive(Debug)]
pub(crate) struct Batch {
    pub id: Uuid,
    pub key: BatchKey,
    pub items: Vec<Pending>,
}

#[derive(Debug)]
pub(crate) enum Command {
    Push(BatchKey, Pending),
    /// Remove a report from its open batch, if it is still there.
    Cancel(Uuid, oneshot::Sender<Option<Pending>>),
    /// Flush every open batch now.
    Flush(oneshot::Sender<()>),
}

struct OpenBatch {
    deadline: Instant,
    items: Vec<Pending>,
}

pub(crate) async fn run(
    mut commands: mpsc::Receiver<Command>,
    window: AggregationWindow,
    shutdown: CancellationToken,
    mut flush: impl FnMut(Batch),
) {
    let wait = Duration::from_millis(window.max_wait_ms);
    let mut open: BTreeMap<BatchKey, OpenBatch> = BTreeMap::new();

    loop {
        let next = open.values().map(|b| b.deadline).min();
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Push(key, item)) => {
                    let batch = open.entry(key.clone()).or_insert_with(|| OpenBatch {
                        deadline: Instant::now() + wait,
                        items: Vec::new(),
                    });
                    batch.items.push(item);
                    if batch.items.len() >= window.max_messages {
                        if let Some(full) = open.remove(&key) {
                            flush(seal(key, full));
                        }
                    }
                }
                Some(Command::Cancel(id, reply)) => {
                    let _ = reply.send(take(&mut open, id));
                }
                Some(Command::Flush(done)) => {
                    flush_all(&mut open, &mut flush);
                    let _ = done.send(());
                }
                None => {
                    flush_all(&mut open, &mut flush);
                    break;
                }
            },
            _ = sleep_until(next.unwrap_or_else(|| Instant::now() + wait)), if next.is_some() => {
                let now = Instant::now();
                let due: Vec<BatchKey> = open
                    .iter()
                    .filter(|(_, b)| b.deadline <= now)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in due {
                    if let Some(batch) = open.remove(&key) {
                        flush(seal(key, batch));
                    }
                }
            }
            _ = shutdown.cancelled() => {
                flush_all(&mut open, &mut flush);
                break;
            }
        }
    }
    tracing::debug!("aggregator stopped");
}

fn seal(key: BatchKey, batch: OpenBatch) -> Batch {
    Batch {
        id: Uuid::new_v4(),
        key,
        items: batch.items,
    }
}

fn flush_all(open: &mut BTreeMap<BatchKey, OpenBatch>, flush: &mut impl FnMut(Batch)) {
    for (key, batch) in std::mem::take(open) {
        flush(seal(key, batch));
    }
}

fn take(open: &mut BTreeMap<BatchKey, OpenBatch>, id: Uuid) -> Option<Pending> {
    let (key, pos) = open.iter().find_map(|(k, b)| {
        b.items
            .iter()
            .position(|p| p.message_id == id)
            .map(|pos| (k.clone(), pos))
    })?;
    let batch = open.get_mut(&key)?;
    let item = batch.items.remove(pos);
    if batch.items.is_empty() {
        open.remove(&key);
    }
    Some(item)
}
