//! Priority task queue with deduplication and a single pull-loop.
//!
//! One logical worker: exactly one task body executes at a time, so tasks
//! can share in-process state without locks. Reactive one-shot tasks carry
//! a higher default priority than periodic ones, so user-triggered work is
//! never starved by routine polling. Before a task is enqueued the pending
//! entries are scanned for a structurally equal one, so two rapid triggers
//! for the same resource collapse into a single queued task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::gitlab::GitLabApi;
use crate::hooks::HookManager;
use crate::store::Store;
use crate::tasklog::TaskLogRegistry;
use crate::tasks::Task;
use crate::tasks::periodic::PeriodicTask;

/// Shared collaborators every task needs while running.
pub struct Context {
    pub store: Arc<dyn Store>,
    pub gitlab: Arc<dyn GitLabApi>,
    pub hooks: Arc<HookManager>,
    pub logs: Arc<TaskLogRegistry>,
}

enum Queued {
    Basic(Task),
    /// Index into the registered periodic task slots.
    Periodic(usize),
}

struct Entry {
    item: Queued,
    priority: i32,
    initial: bool,
    seq: u64,
}

struct PeriodicSlot {
    task: tokio::sync::Mutex<Box<dyn PeriodicTask>>,
    name: &'static str,
    priority: i32,
}

#[derive(Default)]
struct QueueState {
    entries: Vec<Entry>,
    seq: u64,
}

struct Inner {
    state: Mutex<QueueState>,
    periodic: Mutex<Vec<Arc<PeriodicSlot>>>,
    notify: Notify,
    stopped: AtomicBool,
    ctx: Context,
}

/// The task queue. Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<Inner>,
}

impl TaskQueue {
    pub fn new(ctx: Context) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                periodic: Mutex::new(Vec::new()),
                notify: Notify::new(),
                stopped: AtomicBool::new(false),
                ctx,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.ctx.store
    }

    pub fn gitlab(&self) -> &Arc<dyn GitLabApi> {
        &self.inner.ctx.gitlab
    }

    pub fn hooks(&self) -> &Arc<HookManager> {
        &self.inner.ctx.hooks
    }

    pub fn logs(&self) -> &Arc<TaskLogRegistry> {
        &self.inner.ctx.logs
    }

    /// Enqueue a one-shot task. Periodic tasks go through [`schedule`]
    /// instead; the type system keeps them out of here.
    ///
    /// [`schedule`]: TaskQueue::schedule
    pub fn add(&self, task: Task) -> bool {
        self.push(task, false)
    }

    /// Enqueue unless a structurally equal task is already pending.
    /// Returns false when the task was dropped as a duplicate.
    pub fn push(&self, task: Task, initial: bool) -> bool {
        {
            let mut state = self.inner.state.lock().unwrap();
            let duplicate = state
                .entries
                .iter()
                .any(|e| matches!(&e.item, Queued::Basic(t) if *t == task));
            if duplicate {
                return false;
            }
            state.seq += 1;
            let entry = Entry {
                priority: task.priority(),
                item: Queued::Basic(task),
                initial,
                seq: state.seq,
            };
            state.entries.push(entry);
        }
        self.inner.notify.notify_one();
        true
    }

    /// Register a periodic task for start/stop lifecycle management.
    /// It is not enqueued until [`start`] arms it.
    ///
    /// [`start`]: TaskQueue::start
    pub fn schedule(&self, task: Box<dyn PeriodicTask>) {
        let slot = Arc::new(PeriodicSlot {
            name: task.name(),
            priority: task.priority(),
            task: tokio::sync::Mutex::new(task),
        });
        self.inner.periodic.lock().unwrap().push(slot);
    }

    /// Pending one-shot tasks, in queue order. Inspection only.
    pub fn pending(&self) -> Vec<Task> {
        let state = self.inner.state.lock().unwrap();
        let mut entries: Vec<_> = state.entries.iter().collect();
        entries.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        entries
            .iter()
            .filter_map(|e| match &e.item {
                Queued::Basic(t) => Some(t.clone()),
                Queued::Periodic(_) => None,
            })
            .collect()
    }

    /// Begin the pull-loop, then start every registered periodic task and
    /// arm its initial timer.
    pub async fn start(&self) {
        let queue = self.clone();
        tokio::spawn(async move { queue.pull_loop().await });

        let slots: Vec<_> = self.inner.periodic.lock().unwrap().clone();
        for (index, slot) in slots.iter().enumerate() {
            {
                let mut task = slot.task.lock().await;
                if let Err(e) = task.start(self).await {
                    warn!(task = slot.name, "periodic task start failed: {e}");
                }
            }
            self.arm_periodic(index, true);
        }
        info!(periodic = slots.len(), "task queue started");
    }

    /// Stop pulling new entries and run every periodic task's stop hook.
    /// The in-flight task, if any, runs to completion.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();

        let slots: Vec<_> = self.inner.periodic.lock().unwrap().clone();
        for slot in slots {
            let mut task = slot.task.lock().await;
            if let Err(e) = task.stop(self).await {
                warn!(task = slot.name, "periodic task stop failed: {e}");
            }
        }
        info!("task queue stopped");
    }

    fn arm_periodic(&self, index: usize, initial: bool) {
        let delay = {
            let slots = self.inner.periodic.lock().unwrap();
            let Some(slot) = slots.get(index) else { return };
            // delay() is a pure function of the schedule; try_lock never
            // contends here because re-arming happens on the loop thread
            slot.task
                .try_lock()
                .map(|t| t.delay(initial))
                .unwrap_or_default()
        };
        let queue = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            queue.push_periodic(index);
        });
    }

    fn push_periodic(&self, index: usize) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let priority = {
            let slots = self.inner.periodic.lock().unwrap();
            let Some(slot) = slots.get(index) else { return };
            slot.priority
        };
        {
            let mut state = self.inner.state.lock().unwrap();
            let duplicate = state
                .entries
                .iter()
                .any(|e| matches!(e.item, Queued::Periodic(i) if i == index));
            if duplicate {
                return;
            }
            state.seq += 1;
            let entry = Entry {
                item: Queued::Periodic(index),
                priority,
                initial: false,
                seq: state.seq,
            };
            state.entries.push(entry);
        }
        self.inner.notify.notify_one();
    }

    /// Remove the highest-priority entry, FIFO among equals.
    fn pop_next(&self) -> Option<Entry> {
        let mut state = self.inner.state.lock().unwrap();
        let best = state
            .entries
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
            .map(|(i, _)| i)?;
        Some(state.entries.remove(best))
    }

    async fn pull_loop(&self) {
        loop {
            if self.inner.stopped.load(Ordering::SeqCst) {
                return;
            }
            while let Some(entry) = self.pop_next() {
                self.run_entry(entry).await;
                if self.inner.stopped.load(Ordering::SeqCst) {
                    return;
                }
            }
            let notified = self.inner.notify.notified();
            if self.inner.stopped.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// Run one entry. A failing task is logged and never takes the loop
    /// down with it.
    async fn run_entry(&self, entry: Entry) {
        match entry.item {
            Queued::Basic(task) => {
                debug!(task = %task, initial = entry.initial, "running task");
                if let Err(e) = task.run(self).await {
                    error!(task = %task, "task failed: {e}");
                }
            }
            Queued::Periodic(index) => {
                let slot = {
                    let slots = self.inner.periodic.lock().unwrap();
                    slots.get(index).cloned()
                };
                let Some(slot) = slot else { return };
                {
                    let mut task = slot.task.lock().await;
                    if let Err(e) = task.run(self).await {
                        error!(task = slot.name, "periodic task failed: {e}");
                    }
                }
                self.arm_periodic(index, false);
            }
        }
    }
}
