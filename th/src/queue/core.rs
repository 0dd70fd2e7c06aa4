//! EventQueue implementation

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, warn};

use super::config::QueueConfig;

/// Snapshot of the active window, published after every admission
#[derive(Debug, Clone, PartialEq)]
pub struct Activation<T> {
    /// Every task currently active, not just the newly admitted ones
    pub active: Vec<T>,

    /// Tasks still waiting for a slot
    pub pending: usize,
}

type Matcher<T, D> = Arc<dyn Fn(&D, &T) -> bool + Send + Sync>;

/// Internal state protected by mutex
struct QueueInner<T> {
    pending: VecDeque<T>,
    active: Vec<T>,
    max_concurrency: usize,

    /// A dispatch cycle has been spawned and has not run yet
    scheduled: bool,

    /// Nothing active and nothing pending
    idle: bool,

    destroyed: bool,
    tx: Option<broadcast::Sender<Activation<T>>>,
}

/// Admission engine bounding how many tasks are in flight at once
///
/// `T` is the task, `D` the descriptor handed to [`EventQueue::complete_task`];
/// the matcher given at construction decides which active task a descriptor
/// refers to. Handles are cheap to clone and share the same queue.
pub struct EventQueue<T, D = T> {
    inner: Arc<Mutex<QueueInner<T>>>,
    matcher: Matcher<T, D>,
}

impl<T, D> Clone for EventQueue<T, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            matcher: Arc::clone(&self.matcher),
        }
    }
}

impl<T> EventQueue<T, T>
where
    T: Clone + Debug + PartialEq + Send + Sync + 'static,
{
    /// Queue whose tasks are completed by passing an equal task
    pub fn matching_eq(config: QueueConfig) -> Self {
        Self::new(config, |descriptor: &T, task: &T| descriptor == task)
    }
}

impl<T, D> EventQueue<T, D>
where
    T: Clone + Debug + Send + Sync + 'static,
    D: Debug + 'static,
{
    /// Create a queue with the given configuration and completion matcher
    pub fn new(config: QueueConfig, matcher: impl Fn(&D, &T) -> bool + Send + Sync + 'static) -> Self {
        debug!(?config, "EventQueue::new: called");
        let (tx, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                pending: VecDeque::new(),
                active: Vec::new(),
                max_concurrency: clamp_concurrency(config.max_concurrency),
                scheduled: false,
                idle: true,
                destroyed: false,
                tx: Some(tx),
            })),
            matcher: Arc::new(matcher),
        }
    }

    /// Listen for activation events
    ///
    /// Returns None once the queue has been destroyed.
    pub async fn subscribe(&self) -> Option<broadcast::Receiver<Activation<T>>> {
        let inner = self.inner.lock().await;
        inner.tx.as_ref().map(|tx| tx.subscribe())
    }

    /// Append a task to the pending list
    ///
    /// Admission happens in a dispatch cycle spawned onto the runtime, so
    /// several enqueues made without yielding are admitted in one pass.
    pub async fn enqueue(&self, task: T) {
        debug!(?task, "EventQueue::enqueue: called");
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            debug!("EventQueue::enqueue: destroyed, ignoring");
            return;
        }

        inner.pending.push_back(task);
        inner.idle = false;
        if !inner.scheduled {
            self.schedule(&mut inner);
        }
    }

    /// Remove the first active task matching `descriptor`
    ///
    /// Returns false when nothing matched; that is logged, never raised.
    pub async fn complete_task(&self, descriptor: &D) -> bool {
        debug!(?descriptor, "EventQueue::complete_task: called");
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            debug!("EventQueue::complete_task: destroyed, ignoring");
            return false;
        }

        let Some(index) = inner.active.iter().position(|task| (self.matcher)(descriptor, task)) else {
            error!(?descriptor, active = inner.active.len(), "EventQueue: no active task matches completion");
            return false;
        };

        let task = inner.active.remove(index);
        debug!(?task, "EventQueue::complete_task: removed");

        if !inner.pending.is_empty() {
            if !inner.scheduled {
                self.schedule(&mut inner);
            }
        } else if inner.active.is_empty() {
            debug!("EventQueue::complete_task: drained, now idle");
            inner.idle = true;
        }
        true
    }

    /// Publish the current active window again without changing it
    pub async fn re_activation(&self) {
        debug!("EventQueue::re_activation: called");
        let inner = self.inner.lock().await;
        if inner.destroyed {
            return;
        }
        emit(&inner);
    }

    /// Change the concurrency limit for subsequent dispatch cycles
    ///
    /// An active window larger than the new limit is left alone and shrinks
    /// only as its tasks complete.
    pub async fn set_max_concurrency(&self, max: usize) {
        debug!(max, "EventQueue::set_max_concurrency: called");
        let mut inner = self.inner.lock().await;
        if inner.destroyed {
            return;
        }

        inner.max_concurrency = clamp_concurrency(max);
        if inner.active.len() < inner.max_concurrency && !inner.pending.is_empty() && !inner.scheduled {
            self.schedule(&mut inner);
        }
    }

    /// Drop all tasks and detach every listener
    pub async fn destroy(&self) {
        debug!("EventQueue::destroy: called");
        let mut inner = self.inner.lock().await;
        inner.pending.clear();
        inner.active.clear();
        inner.destroyed = true;
        inner.idle = true;
        // Dropping the sender closes every receiver
        inner.tx = None;
    }

    pub async fn active(&self) -> Vec<T> {
        self.inner.lock().await.active.clone()
    }

    pub async fn pending_len(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub async fn max_concurrency(&self) -> usize {
        self.inner.lock().await.max_concurrency
    }

    pub async fn is_idle(&self) -> bool {
        self.inner.lock().await.idle
    }

    pub async fn is_destroyed(&self) -> bool {
        self.inner.lock().await.destroyed
    }

    fn schedule(&self, inner: &mut QueueInner<T>) {
        inner.scheduled = true;
        tokio::spawn(dispatch(Arc::clone(&self.inner)));
    }
}

/// One dispatch cycle: fill the active window, then announce it
async fn dispatch<T>(inner: Arc<Mutex<QueueInner<T>>>)
where
    T: Clone + Debug + Send + Sync + 'static,
{
    let mut inner = inner.lock().await;
    inner.scheduled = false;
    if inner.destroyed {
        return;
    }

    let mut admitted = 0;
    while inner.active.len() < inner.max_concurrency {
        let Some(task) = inner.pending.pop_front() else {
            break;
        };
        inner.active.push(task);
        admitted += 1;
    }

    debug!(
        admitted,
        active = inner.active.len(),
        pending = inner.pending.len(),
        "EventQueue::dispatch: cycle finished"
    );
    if admitted > 0 {
        emit(&inner);
    }
}

fn emit<T: Clone>(inner: &QueueInner<T>) {
    let Some(tx) = inner.tx.as_ref() else {
        return;
    };

    if tx.receiver_count() == 0 {
        // Tasks stay active; a late listener recovers them via re_activation
        error!(
            active = inner.active.len(),
            pending = inner.pending.len(),
            "EventQueue: activation fired with no listener"
        );
        return;
    }

    let _ = tx.send(Activation {
        active: inner.active.clone(),
        pending: inner.pending.len(),
    });
}

fn clamp_concurrency(max: usize) -> usize {
    if max == 0 {
        warn!("EventQueue: max concurrency of 0 clamped to 1");
        1
    } else {
        max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use proptest::prelude::*;
    use tokio::sync::broadcast::error::RecvError;

    fn queue(max: usize) -> EventQueue<u32> {
        EventQueue::matching_eq(QueueConfig::default().with_max_concurrency(max))
    }

    async fn next(rx: &mut broadcast::Receiver<Activation<u32>>) -> Activation<u32> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("activation timed out")
            .expect("activation channel closed")
    }

    async fn assert_silent(rx: &mut broadcast::Receiver<Activation<u32>>) {
        let res = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(res.is_err(), "expected no activation, got {:?}", res);
    }

    #[tokio::test]
    async fn test_seven_tasks_with_limit_five() {
        let q = queue(5);
        let mut rx = q.subscribe().await.unwrap();

        for task in 1..=7 {
            q.enqueue(task).await;
        }

        let first = next(&mut rx).await;
        assert_eq!(first.active, vec![1, 2, 3, 4, 5]);
        assert_eq!(first.pending, 2);

        assert!(q.complete_task(&3).await);

        let second = next(&mut rx).await;
        assert_eq!(second.active, vec![1, 2, 4, 5, 6]);
        assert_eq!(second.pending, 1);
    }

    #[tokio::test]
    async fn test_enqueue_below_limit_admitted_without_completion() {
        let q = queue(5);
        let mut rx = q.subscribe().await.unwrap();

        q.enqueue(1).await;
        assert_eq!(next(&mut rx).await.active, vec![1]);

        q.enqueue(2).await;
        let activation = next(&mut rx).await;
        assert_eq!(activation.active, vec![1, 2]);
        assert_eq!(activation.pending, 0);
    }

    #[tokio::test]
    async fn test_duplicates_are_separate_tasks() {
        let q = queue(5);
        let mut rx = q.subscribe().await.unwrap();

        q.enqueue(4).await;
        q.enqueue(4).await;
        assert_eq!(next(&mut rx).await.active, vec![4, 4]);

        // Each completion releases one copy
        assert!(q.complete_task(&4).await);
        assert_eq!(q.active().await, vec![4]);
        assert!(q.complete_task(&4).await);
        assert!(!q.complete_task(&4).await);
        assert!(q.is_idle().await);
    }

    #[tokio::test]
    async fn test_complete_task_miss_leaves_state() {
        let q = queue(2);
        let mut rx = q.subscribe().await.unwrap();
        for task in 1..=3 {
            q.enqueue(task).await;
        }
        next(&mut rx).await;

        assert!(!q.complete_task(&42).await);
        assert_eq!(q.active().await, vec![1, 2]);
        assert_eq!(q.pending_len().await, 1);
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_custom_matcher() {
        let q: EventQueue<(u32, &'static str), u32> =
            EventQueue::new(QueueConfig::default(), |id: &u32, task: &(u32, &'static str)| *id == task.0);
        let mut rx = q.subscribe().await.unwrap();

        q.enqueue((7, "exec")).await;
        q.enqueue((8, "exec")).await;
        rx.recv().await.unwrap();

        assert!(q.complete_task(&8).await);
        assert_eq!(q.active().await, vec![(7, "exec")]);
    }

    #[tokio::test]
    async fn test_destroy_makes_operations_noops() {
        let q = queue(2);
        let mut rx = q.subscribe().await.unwrap();
        q.enqueue(1).await;
        next(&mut rx).await;

        q.destroy().await;
        assert!(matches!(rx.recv().await, Err(RecvError::Closed)));

        q.enqueue(2).await;
        assert!(!q.complete_task(&1).await);
        q.re_activation().await;
        q.set_max_concurrency(10).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(q.active().await.is_empty());
        assert_eq!(q.pending_len().await, 0);
        assert!(q.is_destroyed().await);
        assert!(q.subscribe().await.is_none());
    }

    #[tokio::test]
    async fn test_re_activation_republishes_same_window() {
        let q = queue(3);
        let mut rx = q.subscribe().await.unwrap();
        q.enqueue(1).await;
        q.enqueue(2).await;
        let first = next(&mut rx).await;

        q.re_activation().await;
        assert_eq!(next(&mut rx).await, first);
        assert_eq!(q.active().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_no_listener_still_admits() {
        let q = queue(2);
        q.enqueue(1).await;
        q.enqueue(2).await;
        q.enqueue(3).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(q.active().await, vec![1, 2]);

        // A late listener picks the window up on demand
        let mut rx = q.subscribe().await.unwrap();
        q.re_activation().await;
        assert_eq!(next(&mut rx).await.active, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_set_max_concurrency_applies_next_cycle() {
        let q = queue(2);
        let mut rx = q.subscribe().await.unwrap();
        for task in 1..=4 {
            q.enqueue(task).await;
        }
        assert_eq!(next(&mut rx).await.active.len(), 2);

        q.set_max_concurrency(3).await;
        let raised = next(&mut rx).await;
        assert_eq!(raised.active, vec![1, 2, 3]);
        assert_eq!(raised.pending, 1);

        // Lowering never evicts already-active tasks
        q.set_max_concurrency(1).await;
        assert_eq!(q.max_concurrency().await, 1);
        assert!(q.complete_task(&1).await);
        assert_silent(&mut rx).await;
        assert_eq!(q.active().await, vec![2, 3]);
        assert_eq!(q.pending_len().await, 1);
    }

    #[tokio::test]
    async fn test_zero_concurrency_clamped() {
        let q = queue(0);
        assert_eq!(q.max_concurrency().await, 1);
    }

    #[tokio::test]
    async fn test_idle_after_drain() {
        let q = queue(2);
        let mut rx = q.subscribe().await.unwrap();
        assert!(q.is_idle().await);

        q.enqueue(1).await;
        assert!(!q.is_idle().await);
        next(&mut rx).await;

        assert!(q.complete_task(&1).await);
        assert!(q.is_idle().await);
    }

    #[tokio::test]
    async fn test_burst_coalesces_into_one_cycle() {
        let q = queue(10);
        let mut rx = q.subscribe().await.unwrap();
        for task in 0..10 {
            q.enqueue(task).await;
        }

        assert_eq!(next(&mut rx).await.active.len(), 10);
        assert_silent(&mut rx).await;
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue,
        CompleteOldest,
        CompleteMissing,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Enqueue),
            2 => Just(Op::CompleteOldest),
            1 => Just(Op::CompleteMissing),
        ]
    }

    proptest! {
        #[test]
        fn prop_active_never_exceeds_limit(max in 1usize..6, ops in proptest::collection::vec(op(), 1..60)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let q = queue(max);
                let mut rx = q.subscribe().await.unwrap();
                let mut next_task = 0u32;

                for op in ops {
                    match op {
                        Op::Enqueue => {
                            q.enqueue(next_task).await;
                            next_task += 1;
                        }
                        Op::CompleteOldest => {
                            if let Some(first) = q.active().await.first().copied() {
                                assert!(q.complete_task(&first).await);
                            }
                        }
                        Op::CompleteMissing => {
                            assert!(!q.complete_task(&u32::MAX).await);
                        }
                    }
                    tokio::task::yield_now().await;

                    assert!(q.active().await.len() <= max);
                    while let Ok(activation) = rx.try_recv() {
                        assert!(activation.active.len() <= max);
                    }
                }
            });
        }
    }
}
