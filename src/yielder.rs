// Copyright 2024 Developers of the tablediff project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The yielder: a priority-ordered concurrent executor that is simultaneously
//! a task queue and a result stream.
//!
//! Tasks are boxed futures submitted with a priority; lower values run
//! sooner, ties break in submission order. A single dispatcher pops the
//! highest-priority task whenever a semaphore permit is free, so the
//! concurrency cap doubles as the scheduling point: with one permit the
//! yielder degenerates to deterministic in-order execution. Tasks may submit
//! further tasks; the run ends when all submitted tasks, transitively, have
//! finished.
//!
//! Diff batches produced by tasks are forwarded to the consumer's
//! [`DiffStream`] as they are produced. A task error aborts the run: queued
//! tasks are dropped, in-flight tasks complete, and the error surfaces on the
//! consumer's next pull. Dropping the stream is the cooperative stop signal.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, trace};

use crate::error::DiffError;
use crate::info_tree::InfoTree;
use crate::rowdiff::DiffEntry;
use crate::stats::{DiffSummary, SignAccumulator};

/// What one scheduled task produced: optionally a batch of diff entries to
/// forward to the consumer.
pub type TaskOutcome = Result<Option<Vec<DiffEntry>>, DiffError>;

/// One item on the result channel.
#[derive(Debug)]
pub enum YieldItem {
    Batch(Vec<DiffEntry>),
    Failed(DiffError),
}

struct QueuedTask {
    priority: u32,
    seq: u64,
    future: BoxFuture<'static, TaskOutcome>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &QueuedTask) -> bool {
        (self.priority, self.seq) == (other.priority, other.seq)
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &QueuedTask) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // BinaryHeap is a max-heap; invert so the smallest (priority, seq) pops
    // first: lower value = higher priority, FIFO tie-break.
    fn cmp(&self, other: &QueuedTask) -> CmpOrdering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

struct YielderShared {
    queue: Mutex<BinaryHeap<QueuedTask>>,
    /// Tasks queued or running. The run is over when this reaches zero.
    pending: AtomicUsize,
    next_seq: AtomicU64,
    /// Wakes the dispatcher; it is the only waiter.
    wakeup: Notify,
    limit: Arc<Semaphore>,
    results: UnboundedSender<YieldItem>,
    aborted: AtomicBool,
    error: Mutex<Option<DiffError>>,
}

impl YielderShared {
    fn forward(&self, batch: Vec<DiffEntry>) {
        if self.results.send(YieldItem::Batch(batch)).is_err() {
            // Consumer hung up: stop admitting work, let in-flight finish.
            self.record_error(DiffError::Cancelled);
            self.aborted.store(true, Ordering::SeqCst);
            self.wakeup.notify_one();
        }
    }

    fn fail(&self, error: DiffError) {
        self.record_error(error.clone());
        self.aborted.store(true, Ordering::SeqCst);
        let _ = self.results.send(YieldItem::Failed(error));
        self.wakeup.notify_one();
    }

    fn record_error(&self, error: DiffError) {
        let mut guard = self.error.lock().unwrap();
        if guard.is_none() {
            *guard = Some(error);
        }
    }

    fn task_done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.wakeup.notify_one();
        }
    }

    fn drain_queue(&self) {
        let drained = {
            let mut queue = self.queue.lock().unwrap();
            std::mem::take(&mut *queue)
        };
        let dropped = drained.len();
        if dropped > 0 {
            debug!("dropping {dropped} queued tasks after abort");
        }
        for _ in 0..dropped {
            self.task_done();
        }
    }
}

/// Handle for submitting tasks and driving the run. Cheap to clone; every
/// task receives one so it can submit follow-up work.
#[derive(Clone)]
pub struct ThreadedYielder {
    shared: Arc<YielderShared>,
}

impl ThreadedYielder {
    /// Create a yielder bounded to `max_concurrency` simultaneous tasks and
    /// the receiving half of its result channel.
    pub fn new(max_concurrency: usize) -> (ThreadedYielder, UnboundedReceiver<YieldItem>) {
        let (results, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(YielderShared {
            queue: Mutex::new(BinaryHeap::new()),
            pending: AtomicUsize::new(0),
            next_seq: AtomicU64::new(0),
            wakeup: Notify::new(),
            limit: Arc::new(Semaphore::new(max_concurrency.max(1))),
            results,
            aborted: AtomicBool::new(false),
            error: Mutex::new(None),
        });
        (ThreadedYielder { shared }, receiver)
    }

    /// Schedule a task. Lower priority values run sooner; equal priorities
    /// run in submission order. Tasks submitted after an abort are dropped.
    pub fn submit<F>(&self, priority: u32, task: F)
    where
        F: Future<Output = TaskOutcome> + Send + 'static,
    {
        if self.shared.aborted.load(Ordering::SeqCst) {
            return;
        }
        let seq = self.shared.next_seq.fetch_add(1, Ordering::SeqCst);
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        self.shared.queue.lock().unwrap().push(QueuedTask {
            priority,
            seq,
            future: task.boxed(),
        });
        self.shared.wakeup.notify_one();
    }

    /// Run tasks until everything submitted, transitively, has finished.
    ///
    /// Call once, from a task on the runtime; workers are spawned as permits
    /// free up.
    pub async fn drive(&self) {
        loop {
            let permit = match self.shared.limit.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let task = loop {
                if self.shared.aborted.load(Ordering::SeqCst) {
                    self.shared.drain_queue();
                }
                let next = self.shared.queue.lock().unwrap().pop();
                if let Some(task) = next {
                    break task;
                }
                if self.shared.pending.load(Ordering::SeqCst) == 0 {
                    return;
                }
                self.shared.wakeup.notified().await;
            };
            trace!(priority = task.priority, seq = task.seq, "starting task");
            let worker = self.shared.clone();
            tokio::spawn(async move {
                let outcome = task.future.await;
                match outcome {
                    Ok(Some(batch)) if !batch.is_empty() => worker.forward(batch),
                    Ok(_) => {}
                    Err(error) => worker.fail(error),
                }
                drop(permit);
                worker.task_done();
            });
        }
    }

    /// Abort the run with an error; queued tasks are dropped and the error
    /// is surfaced to the consumer.
    pub fn fail(&self, error: DiffError) {
        self.shared.fail(error);
    }

    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.load(Ordering::SeqCst)
    }

    /// The first error recorded during the run, if any.
    pub fn error(&self) -> Option<DiffError> {
        self.shared.error.lock().unwrap().clone()
    }
}

/// The consumer's handle on a running diff: a stream of signed rows, the
/// bisection record, and post-run statistics.
///
/// Entries arrive as tasks complete; they are not globally sorted, but within
/// one leaf a key's `-` rows precede its `+` rows and all rows for a key are
/// contiguous. Dropping the stream cooperatively cancels the run.
#[derive(Debug)]
pub struct DiffStream {
    receiver: UnboundedReceiver<YieldItem>,
    buffered: VecDeque<DiffEntry>,
    tree: Arc<InfoTree>,
    accumulator: SignAccumulator,
    extra_stats: Arc<Mutex<BTreeMap<String, u64>>>,
    error: Option<DiffError>,
    ended: bool,
}

impl DiffStream {
    pub(crate) fn new(
        receiver: UnboundedReceiver<YieldItem>,
        tree: Arc<InfoTree>,
        key_len: usize,
        extra_stats: Arc<Mutex<BTreeMap<String, u64>>>,
    ) -> DiffStream {
        DiffStream {
            receiver,
            buffered: VecDeque::new(),
            tree,
            accumulator: SignAccumulator::new(key_len),
            extra_stats,
            error: None,
            ended: false,
        }
    }

    /// The next diff entry, or `None` when the run is complete.
    pub async fn next(&mut self) -> Option<Result<DiffEntry, DiffError>> {
        futures::StreamExt::next(self).await
    }

    /// The next whole task batch: every entry one leaf produced, as one item.
    pub async fn next_batch(&mut self) -> Option<Result<Vec<DiffEntry>, DiffError>> {
        if !self.buffered.is_empty() {
            return Some(Ok(self.buffered.drain(..).collect()));
        }
        if self.ended {
            return None;
        }
        match self.receiver.recv().await {
            Some(YieldItem::Batch(batch)) => {
                self.accumulator.record_batch(&batch);
                Some(Ok(batch))
            }
            Some(YieldItem::Failed(error)) => {
                self.ended = true;
                self.error = Some(error.clone());
                Some(Err(error))
            }
            None => {
                self.ended = true;
                None
            }
        }
    }

    /// The bisection record. Fully aggregated once the stream has ended.
    pub fn info_tree(&self) -> Arc<InfoTree> {
        self.tree.clone()
    }

    /// Drain the remaining entries and summarize the run.
    pub async fn summary(&mut self) -> Result<DiffSummary, DiffError> {
        while let Some(batch) = self.next_batch().await {
            batch?;
        }
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        let extra = self.extra_stats.lock().unwrap().clone();
        Ok(self.accumulator.finish(&self.tree, extra))
    }
}

impl Stream for DiffStream {
    type Item = Result<DiffEntry, DiffError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(entry) = this.buffered.pop_front() {
                return Poll::Ready(Some(Ok(entry)));
            }
            if this.ended {
                return Poll::Ready(None);
            }
            match this.receiver.poll_recv(cx) {
                Poll::Ready(Some(YieldItem::Batch(batch))) => {
                    this.accumulator.record_batch(&batch);
                    this.buffered.extend(batch);
                }
                Poll::Ready(Some(YieldItem::Failed(error))) => {
                    this.ended = true;
                    this.error = Some(error.clone());
                    return Poll::Ready(Some(Err(error)));
                }
                Poll::Ready(None) => {
                    this.ended = true;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rowdiff::Sign;
    use crate::value::Value;

    fn entry(id: i64) -> DiffEntry {
        (Sign::Plus, vec![Value::Int(id)])
    }

    async fn collect(mut receiver: UnboundedReceiver<YieldItem>) -> Vec<YieldItem> {
        let mut items = Vec::new();
        while let Some(item) = receiver.recv().await {
            items.push(item);
        }
        items
    }

    fn batch_ids(items: &[YieldItem]) -> Vec<i64> {
        items
            .iter()
            .filter_map(|item| match item {
                YieldItem::Batch(batch) => match &batch[0].1[0] {
                    Value::Int(id) => Some(*id),
                    _ => None,
                },
                YieldItem::Failed(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn serial_mode_runs_in_priority_order() {
        let (yielder, receiver) = ThreadedYielder::new(1);
        for (priority, id) in [(5u32, 5i64), (1, 1), (3, 3)] {
            yielder.submit(priority, async move { Ok(Some(vec![entry(id)])) });
        }
        yielder.drive().await;
        drop(yielder);
        let items = collect(receiver).await;
        assert_eq!(batch_ids(&items), vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn equal_priorities_run_in_submission_order() {
        let (yielder, receiver) = ThreadedYielder::new(1);
        for id in 0..5i64 {
            yielder.submit(7, async move { Ok(Some(vec![entry(id)])) });
        }
        yielder.drive().await;
        drop(yielder);
        let items = collect(receiver).await;
        assert_eq!(batch_ids(&items), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn tasks_can_submit_recursively() {
        let (yielder, receiver) = ThreadedYielder::new(4);
        let handle = yielder.clone();
        yielder.submit(0, async move {
            for id in 0..3i64 {
                let inner = handle.clone();
                handle.submit(1, async move {
                    inner.submit(2, async move { Ok(Some(vec![entry(100 + id)])) });
                    Ok(None)
                });
            }
            Ok(None)
        });
        yielder.drive().await;
        drop(yielder);
        let items = collect(receiver).await;
        let mut ids = batch_ids(&items);
        ids.sort_unstable();
        assert_eq!(ids, vec![100, 101, 102]);
    }

    #[tokio::test]
    async fn an_error_aborts_and_drops_queued_tasks() {
        let (yielder, receiver) = ThreadedYielder::new(1);
        yielder.submit(1, async move {
            Err(DiffError::Datasource("connection reset".into()))
        });
        yielder.submit(2, async move { Ok(Some(vec![entry(9)])) });
        yielder.drive().await;
        assert!(yielder.is_aborted());
        drop(yielder);
        let items = collect(receiver).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0], YieldItem::Failed(DiffError::Datasource(_))));
    }

    #[tokio::test]
    async fn a_dropped_receiver_stops_the_run() {
        let (yielder, receiver) = ThreadedYielder::new(1);
        drop(receiver);
        for id in 0..10i64 {
            yielder.submit(0, async move { Ok(Some(vec![entry(id)])) });
        }
        yielder.drive().await;
        assert!(yielder.is_aborted());
        assert!(matches!(yielder.error(), Some(DiffError::Cancelled)));
    }

    #[tokio::test]
    async fn drive_returns_immediately_with_no_tasks() {
        let (yielder, receiver) = ThreadedYielder::new(4);
        yielder.drive().await;
        drop(yielder);
        assert!(collect(receiver).await.is_empty());
    }
}
