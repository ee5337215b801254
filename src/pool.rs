use std::cell::{Cell, RefCell};
use std::sync::mpsc;
use std::thread;

use log::error;

use crate::event_loop::{EventLoop, LoopHandle};
use crate::poller::PollerKind;

/// Picks the loop for the next connection out of the worker loops.
///
/// Strategies run only on the base loop (the acceptor's thread), so a
/// closure may carry unsynchronized state such as a round-robin cursor.
pub type LoadBalanceStrategy = Box<dyn FnMut(&[LoopHandle]) -> LoopHandle>;

/// Hands out the workers in construction order, wrapping around.
pub fn round_robin() -> LoadBalanceStrategy {
    let mut next = 0;
    Box::new(move |loops| {
        let handle = loops[next].clone();
        next = (next + 1) % loops.len();
        handle
    })
}

/// Hands out the worker currently tracking the fewest channels; the first
/// worker wins ties.
pub fn least_connection() -> LoadBalanceStrategy {
    Box::new(|loops| {
        let mut handle = &loops[0];

        for candidate in &loops[1..] {
            if candidate.channel_count() < handle.channel_count() {
                handle = candidate;
            }
        }

        handle.clone()
    })
}

/// The base loop plus `N` worker loops, each on its own thread.
///
/// With `N == 0` every connection shares the base loop (single-reactor
/// mode); otherwise the strategy picks a worker for each connection.
pub struct LoopPool {
    base: LoopHandle,
    kind: PollerKind,
    num_workers: usize,
    strategy: RefCell<LoadBalanceStrategy>,
    workers: RefCell<Vec<LoopHandle>>,
    threads: RefCell<Vec<thread::JoinHandle<()>>>,
    started: Cell<bool>,
}

impl LoopPool {
    /// Workers inherit the base loop's poller kind.
    pub fn new(base: &EventLoop, num_workers: usize, strategy: LoadBalanceStrategy) -> LoopPool {
        LoopPool {
            base: base.handle(),
            kind: base.kind(),
            num_workers,
            strategy: RefCell::new(strategy),
            workers: RefCell::new(Vec::new()),
            threads: RefCell::new(Vec::new()),
            started: Cell::new(false),
        }
    }

    /// Spawns the worker threads. Each worker constructs its own loop
    /// inside its thread, so the loop's thread identity matches the thread
    /// driving it.
    ///
    /// # Panics
    ///
    /// Panics on double start.
    pub fn start(&self) {
        if self.started.get() {
            panic!("loop pool already started");
        }

        let mut workers = self.workers.borrow_mut();
        let mut threads = self.threads.borrow_mut();

        for i in 0..self.num_workers {
            let kind = self.kind;
            let (tx, rx) = mpsc::channel();

            let thread = thread::Builder::new()
                .name(format!("loop-worker-{}", i))
                .spawn(move || {
                    let event_loop = match EventLoop::with_poller(kind) {
                        Ok(event_loop) => event_loop,
                        Err(e) => panic!("construct worker loop: {}", e),
                    };

                    tx.send(event_loop.handle()).ok();

                    if let Err(e) = event_loop.run() {
                        error!("worker loop {}: {}", event_loop.id(), e);
                    }
                })
                .unwrap_or_else(|e| panic!("spawn loop worker: {}", e));

            let handle = match rx.recv() {
                Ok(handle) => handle,
                Err(_) => panic!("worker loop died during construction"),
            };

            workers.push(handle);
            threads.push(thread);
        }

        self.started.set(true);
    }

    /// The loop that should own the next connection.
    ///
    /// # Panics
    ///
    /// Panics when the pool has not been started.
    pub fn get_next(&self) -> LoopHandle {
        if !self.started.get() {
            panic!("loop pool not started yet");
        }

        if self.num_workers == 0 {
            return self.base.clone();
        }

        let workers = self.workers.borrow();
        (self.strategy.borrow_mut())(&workers)
    }

    pub fn workers(&self) -> Vec<LoopHandle> {
        self.workers.borrow().clone()
    }

    /// Stops every worker loop and joins its thread.
    pub fn stop(&self) {
        for worker in self.workers.borrow().iter() {
            worker.stop();
        }

        for thread in self.threads.borrow_mut().drain(..) {
            let _ = thread.join();
        }
    }
}
