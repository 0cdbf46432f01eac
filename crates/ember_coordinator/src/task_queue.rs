//! Single-consumer task queue backing the recovery manager's worker thread.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

struct QueueState<T> {
    tasks: VecDeque<T>,
    halted: bool,
}

struct Inner<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

/// FIFO queue of ready-to-run tasks with a halt flag.
///
/// Scheduling is safe from any thread and is the only synchronization the
/// recovery manager needs: everything else runs inside task executions, one
/// at a time, on the single consumer. Tasks may schedule further tasks,
/// including while one is being performed.
pub struct TaskQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    tasks: VecDeque::new(),
                    halted: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Append a task. Tasks run in schedule order.
    pub fn schedule(&self, task: T) {
        let mut state = self.inner.state.lock().unwrap();
        state.tasks.push_back(task);
        self.inner.available.notify_one();
    }

    /// Raise the halt flag. The consumer returns after the task it is
    /// currently performing; tasks still queued are dropped with the queue.
    pub fn halt(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.halted = true;
        self.inner.available.notify_all();
    }

    pub fn is_halted(&self) -> bool {
        self.inner.state.lock().unwrap().halted
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop the next task without blocking. Used to drive tasks inline.
    pub fn try_next(&self) -> Option<T> {
        let mut state = self.inner.state.lock().unwrap();
        if state.halted {
            return None;
        }
        state.tasks.pop_front()
    }

    /// Block until a task is available or the queue is halted.
    pub fn next_or_halt(&self) -> Option<T> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.halted {
                return None;
            }
            if let Some(task) = state.tasks.pop_front() {
                return Some(task);
            }
            state = self.inner.available.wait(state).unwrap();
        }
    }

    /// Run tasks in FIFO order on the calling thread until halted. Each task
    /// runs to completion; there is no priority and no preemption.
    pub fn perform_tasks_until_halt(&self, mut run: impl FnMut(T)) {
        while let Some(task) = self.next_or_halt() {
            run(task);
        }
    }
}
