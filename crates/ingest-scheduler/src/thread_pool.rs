//! A dynamically-resized worker pool with a result queue.
//!
//! One counter tracks the in-flight tasks; it shares a lock with the
//! result list, and waiters register themselves under that lock before
//! blocking, so the producer side can always tell whether to deliver a
//! result or a [`ExecuteResult::NoMoreExecutions`] sentinel.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::waker::Waker;
use crate::{Error, Result};

pub(crate) type Job<R> = Box<dyn FnOnce() -> Result<R> + Send + 'static>;

pub(crate) enum ExecuteResult<R> {
    Success(R),
    Fail(Error),
    /// No result is available and none can arrive: every worker is idle
    /// and nothing is in flight.
    NoMoreExecutions,
}

pub(crate) struct ThreadPool<R> {
    workers: Mutex<Vec<Worker>>,
    waker: Arc<Waker<Option<Job<R>>>>,
    results: Arc<ResultsQueue<R>>,
}

struct Worker {
    state: Arc<WorkerState>,
    handle: JoinHandle<()>,
}

struct WorkerState {
    is_working: AtomicBool,
    removed: AtomicBool,
}

impl<R: Send + 'static> ThreadPool<R> {
    pub fn new() -> ThreadPool<R> {
        ThreadPool {
            workers: Mutex::new(Vec::new()),
            waker: Arc::new(Waker::new()),
            results: Arc::new(ResultsQueue::new()),
        }
    }

    /// Grow or shrink the pool to exactly `count` workers.
    ///
    /// Shrinking removes idle workers preferentially; busy ones are marked
    /// for removal and finish their current task first. The call blocks
    /// until the removed workers have joined.
    pub fn set_workers(&self, count: usize) -> Result<()> {
        let mut to_join = Vec::new();
        {
            let mut workers = self.workers.lock().unwrap();
            if self.waker.did_stop() {
                return Ok(());
            }
            if workers.len() < count {
                for _ in workers.len()..count {
                    workers.push(self.spawn_worker()?);
                }
            } else if workers.len() > count {
                let excess = workers.len() - count;
                let mut removed_indexes = Vec::with_capacity(excess);
                for want_working in [false, true] {
                    for (index, worker) in workers.iter().enumerate() {
                        if removed_indexes.len() >= excess {
                            break;
                        }
                        if worker.state.is_working.load(Ordering::SeqCst) == want_working
                            && !removed_indexes.contains(&index)
                        {
                            removed_indexes.push(index);
                        }
                    }
                }
                removed_indexes.sort_unstable();
                for index in removed_indexes.into_iter().rev() {
                    let worker = workers.remove(index);
                    worker.state.removed.store(true, Ordering::SeqCst);
                    to_join.push(worker.handle);
                }
                // kick the idle receivers so they observe their removal
                self.waker.broadcast_with(|| None);
            }
        }
        for handle in to_join {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Enqueue a task; it will run on some worker. Blocks until a worker
    /// takes it over.
    pub fn execute(&self, job: Job<R>) -> Result<()> {
        self.results.add_task();
        if let Err(e) = self.waker.push(Some(job)) {
            self.results.cancel_task();
            return Err(e);
        }
        Ok(())
    }

    /// Block until a completed result is available, or until no more can
    /// arrive.
    pub fn pop_result(&self) -> ExecuteResult<R> {
        self.results.pop()
    }

    /// Transition to the terminal state: pending `execute` calls fail and
    /// waiters wake with [`ExecuteResult::NoMoreExecutions`].
    pub fn stop(&self) {
        let handles: Vec<_> = {
            let mut workers = self.workers.lock().unwrap();
            if self.waker.did_stop() {
                return;
            }
            self.waker.stop();
            workers.drain(..).map(|worker| worker.handle).collect()
        };
        self.results.stop();
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn spawn_worker(&self) -> Result<Worker> {
        let state = Arc::new(WorkerState {
            is_working: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        });
        let handle = std::thread::Builder::new().name(String::from("ingest-worker")).spawn({
            let state = state.clone();
            let waker = self.waker.clone();
            let results = self.results.clone();
            move || run_worker(state, waker, results)
        })?;
        Ok(Worker { state, handle })
    }
}

impl<R> Drop for ThreadPool<R> {
    fn drop(&mut self) {
        let handles: Vec<_> = {
            let mut workers = self.workers.lock().unwrap();
            self.waker.stop();
            workers.drain(..).map(|worker| worker.handle).collect()
        };
        self.results.stop();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn run_worker<R>(
    state: Arc<WorkerState>,
    waker: Arc<Waker<Option<Job<R>>>>,
    results: Arc<ResultsQueue<R>>,
) {
    loop {
        if state.removed.load(Ordering::SeqCst) {
            break;
        }
        let job = match waker.receive() {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(_) => break,
        };
        state.is_working.store(true, Ordering::SeqCst);
        let result = match catch_unwind(AssertUnwindSafe(job)) {
            Ok(result) => result,
            Err(panic) => {
                let msg = match panic.downcast_ref::<&'static str>() {
                    Some(s) => *s,
                    None => match panic.downcast_ref::<String>() {
                        Some(s) => &s[..],
                        None => "Box<dyn Any>",
                    },
                };
                Err(Error::WorkerPanicked(msg.to_string()))
            }
        };
        results.complete(result);
        state.is_working.store(false, Ordering::SeqCst);
    }
}

struct ResultsQueue<R> {
    state: Mutex<ResultsState<R>>,
    cond: Condvar,
}

struct ResultsState<R> {
    results: VecDeque<Result<R>>,
    in_flight: usize,
    waiters: usize,
    stopped: bool,
}

impl<R> ResultsQueue<R> {
    fn new() -> ResultsQueue<R> {
        ResultsQueue {
            state: Mutex::new(ResultsState {
                results: VecDeque::new(),
                in_flight: 0,
                waiters: 0,
                stopped: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn add_task(&self) {
        self.state.lock().unwrap().in_flight += 1;
    }

    fn cancel_task(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;
        self.cond.notify_all();
    }

    fn complete(&self, result: Result<R>) {
        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;
        state.results.push_back(result);
        self.cond.notify_all();
    }

    fn pop(&self) -> ExecuteResult<R> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(result) = state.results.pop_front() {
                return match result {
                    Ok(value) => ExecuteResult::Success(value),
                    Err(e) => ExecuteResult::Fail(e),
                };
            }
            // no completion can wake us if every in-flight task already
            // has a registered waiter
            if state.stopped || state.in_flight <= state.waiters {
                return ExecuteResult::NoMoreExecutions;
            }
            state.waiters += 1;
            state = self.cond.wait(state).unwrap();
            state.waiters -= 1;
        }
    }

    fn stop(&self) {
        self.state.lock().unwrap().stopped = true;
        self.cond.notify_all();
    }
}
