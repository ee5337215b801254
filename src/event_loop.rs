use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;
use log::{error, trace};

use crate::channel::Channel;
use crate::connection::ConnInner;
use crate::context::Context;
use crate::poller::{Poller, PollerKind};
use crate::timer::{TimerId, TimerQueue};
use crate::waker::Waker;

// Each connection read scatters into the loop's scratch buffer past the
// input buffer's tail, so a short read costs one syscall and a large read
// costs no pre-allocation.
const SCRATCH_SIZE: usize = 64 * 1024;

pub(crate) type Task = Box<dyn FnOnce(&EventLoop) + Send>;

static NEXT_LOOP_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    // The loop constructed on this thread, if still alive. Lets a handle
    // detect "called from the owning thread" and run work synchronously.
    static CURRENT_LOOP: RefCell<Option<Weak<LoopInner>>> = RefCell::new(None);
}

/// A single-threaded event loop.
///
/// One `run` iteration merges three sources into a serialized callback
/// stream: poller events, functors queued from other threads, and timer
/// expirations (which arrive as poller events on the timerfd). The loop is
/// driven only by the thread that created it; every other thread talks to
/// it through a [`LoopHandle`].
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

pub(crate) struct LoopInner {
    shared: Arc<LoopShared>,
    kind: PollerKind,
    poller: RefCell<Poller>,
    timers: RefCell<TimerQueue>,
    connections: RefCell<HashMap<u64, Rc<ConnInner>>>,
    next_conn_id: Cell<u64>,
    scratch: RefCell<Vec<u8>>,
    wake_channel: Rc<RefCell<Channel>>,
}

// The Send + Sync face of a loop, shared with every handle.
pub(crate) struct LoopShared {
    id: usize,
    thread: ThreadId,
    running: AtomicBool,
    tasks: ConcurrentQueue<Task>,
    waker: Waker,
    channel_count: AtomicUsize,
    context: Context,
}

impl EventLoop {
    /// A loop multiplexing through epoll.
    pub fn new() -> io::Result<EventLoop> {
        EventLoop::with_poller(PollerKind::Readiness)
    }

    /// A loop multiplexing through the chosen kernel facility.
    ///
    /// # Panics
    ///
    /// One live loop per thread: constructing a second one on the same
    /// thread panics.
    pub fn with_poller(kind: PollerKind) -> io::Result<EventLoop> {
        let occupied = CURRENT_LOOP.with(|current| {
            current
                .borrow()
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some()
        });
        if occupied {
            panic!("an event loop already exists on this thread");
        }

        // The completion poller wants blocking descriptors: the ring, not
        // errno, reports readiness.
        let nonblocking = kind == PollerKind::Readiness;

        let waker = Waker::new(nonblocking)?;

        let mut wake_channel = Channel::new(waker.as_raw_fd());
        wake_channel.set_read_callback(Rc::new(|event_loop: &EventLoop| {
            event_loop.drain_wakeup()
        }));
        wake_channel.enable_read(false);

        let shared = Arc::new(LoopShared {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            thread: thread::current().id(),
            running: AtomicBool::new(false),
            tasks: ConcurrentQueue::unbounded(),
            waker,
            channel_count: AtomicUsize::new(0),
            context: Context::new(),
        });

        let inner = Rc::new(LoopInner {
            shared,
            kind,
            poller: RefCell::new(Poller::new(kind)?),
            timers: RefCell::new(TimerQueue::new(nonblocking)?),
            connections: RefCell::new(HashMap::new()),
            next_conn_id: Cell::new(0),
            scratch: RefCell::new(vec![0u8; SCRATCH_SIZE]),
            wake_channel: Rc::new(RefCell::new(wake_channel)),
        });

        CURRENT_LOOP.with(|current| {
            *current.borrow_mut() = Some(Rc::downgrade(&inner));
        });

        let event_loop = EventLoop { inner };

        let wake_channel = Rc::clone(&event_loop.inner.wake_channel);
        event_loop.update_channel(&wake_channel);

        let timer_channel = event_loop.inner.timers.borrow().channel();
        event_loop.update_channel(&timer_channel);

        trace!("event loop {} created ({:?})", event_loop.id(), kind);

        Ok(event_loop)
    }

    pub fn id(&self) -> usize {
        self.inner.shared.id
    }

    pub fn kind(&self) -> PollerKind {
        self.inner.kind
    }

    /// The per-loop key/value context.
    pub fn context(&self) -> &Context {
        &self.inner.shared.context
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.inner.shared),
        }
    }

    /// Runs the loop until [`LoopHandle::stop`] is posted and drained.
    ///
    /// Each iteration polls, dispatches every active channel's callbacks in
    /// poller order, then drains a snapshot of the functor queue in FIFO
    /// order. A functor queued by a channel callback runs in the same
    /// iteration; one queued by another functor waits for the next.
    pub fn run(&self) -> io::Result<()> {
        self.assert_in_loop();

        self.inner.shared.running.store(true, Ordering::SeqCst);
        trace!("event loop {} running", self.id());

        while self.inner.shared.running.load(Ordering::SeqCst) {
            let active = self.inner.poller.borrow_mut().poll()?;

            for channel in &active {
                Channel::handle_event(channel, self);
            }

            let pending = self.inner.shared.tasks.len();
            for _ in 0..pending {
                match self.inner.shared.tasks.pop() {
                    Ok(task) => task(self),
                    Err(_) => break,
                }
            }
        }

        trace!("event loop {} stopped", self.id());
        Ok(())
    }

    /// See [`LoopHandle::run_in_loop`].
    pub fn run_in_loop(&self, f: impl FnOnce(&EventLoop) + Send + 'static) {
        self.handle().run_in_loop(f);
    }

    /// Schedules `callback` to run on this loop at `deadline`, then every
    /// `interval` after that when `interval` is nonzero. In-loop only; use
    /// the handle from other threads.
    pub fn run_at(
        &self,
        deadline: Instant,
        interval: Duration,
        callback: impl Fn(&EventLoop, TimerId) + 'static,
    ) -> TimerId {
        self.assert_in_loop();
        self.inner
            .timers
            .borrow_mut()
            .add_timer(deadline, interval, Rc::new(callback))
    }

    /// Removes a pending timer; false when it already fired. In-loop only.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.assert_in_loop();
        self.inner.timers.borrow_mut().cancel_timer(id)
    }

    pub(crate) fn update_channel(&self, channel: &Rc<RefCell<Channel>>) {
        self.assert_in_loop();

        let mut poller = self.inner.poller.borrow_mut();
        if let Err(e) = poller.update(channel) {
            panic!("update channel: {}", e);
        }

        self.inner
            .shared
            .channel_count
            .store(poller.channel_count(), Ordering::Relaxed);
    }

    pub(crate) fn remove_channel(&self, channel: &Rc<RefCell<Channel>>) {
        self.assert_in_loop();

        let mut poller = self.inner.poller.borrow_mut();
        if let Err(e) = poller.remove(channel) {
            panic!("remove channel: {}", e);
        }

        self.inner
            .shared
            .channel_count
            .store(poller.channel_count(), Ordering::Relaxed);
    }

    pub(crate) fn alloc_conn_id(&self) -> u64 {
        let id = self.inner.next_conn_id.get();
        self.inner.next_conn_id.set(id + 1);
        id
    }

    pub(crate) fn insert_connection(&self, id: u64, conn: Rc<ConnInner>) {
        self.inner.connections.borrow_mut().insert(id, conn);
    }

    pub(crate) fn connection(&self, id: u64) -> Option<Rc<ConnInner>> {
        self.inner.connections.borrow().get(&id).cloned()
    }

    pub(crate) fn remove_connection(&self, id: u64) {
        self.inner.connections.borrow_mut().remove(&id);
    }

    pub(crate) fn with_scratch<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut scratch = self.inner.scratch.borrow_mut();
        f(&mut scratch)
    }

    // Read callback of the wakeup eventfd's channel.
    pub(crate) fn drain_wakeup(&self) {
        if self.kind() == PollerKind::Readiness {
            if let Err(e) = self.inner.shared.waker.finish() {
                error!("drain wakeup: {}", e);
            }
        }
        // In completion mode the poller's read already consumed the
        // counter; either way the interest bit may need re-arming.
        let wake_channel = Rc::clone(&self.inner.wake_channel);
        let changed = wake_channel.borrow_mut().enable_read(false);
        if changed {
            self.update_channel(&wake_channel);
        }
    }

    // Read callback of the timerfd's channel.
    pub(crate) fn handle_timer_tick(&self) {
        let expired = {
            let mut timers = self.inner.timers.borrow_mut();
            if self.kind() == PollerKind::Readiness {
                timers.drain_fd();
            }
            timers.take_expired()
        };

        for entry in &expired {
            let callback = entry.callback();
            callback(self, entry.id());
        }

        let timer_channel = self.inner.timers.borrow().channel();
        let changed = timer_channel.borrow_mut().enable_read(false);
        if changed {
            self.update_channel(&timer_channel);
        }
    }

    pub(crate) fn assert_in_loop(&self) {
        assert_eq!(
            thread::current().id(),
            self.inner.shared.thread,
            "event loop driven off its owning thread"
        );
    }
}

/// The `Send + Sync` face of a loop. Cheap to clone; valid for the life of
/// the process (posting to a loop that has been dropped is a silent no-op,
/// stopping one is too).
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Runs `f` on the loop's thread.
    ///
    /// Called from the loop's own thread while it is running, `f` runs
    /// synchronously. Otherwise `f` is appended to the functor queue in
    /// FIFO order and the loop's eventfd is written so the next poll
    /// returns.
    pub fn run_in_loop(&self, f: impl FnOnce(&EventLoop) + Send + 'static) {
        if thread::current().id() == self.shared.thread
            && self.shared.running.load(Ordering::SeqCst)
        {
            if let Some(event_loop) = self.current_loop() {
                f(&event_loop);
                return;
            }
        }

        if self.shared.tasks.push(Box::new(f)).is_ok() {
            if let Err(e) = self.shared.waker.wakeup() {
                error!("wakeup loop {}: {}", self.shared.id, e);
            }
        }
    }

    /// Posts a functor that clears the running flag; `run` returns once
    /// the posting iteration finishes.
    pub fn stop(&self) {
        let shared = Arc::clone(&self.shared);
        self.run_in_loop(move |_| {
            shared.running.store(false, Ordering::SeqCst);
        });
    }

    /// Schedules a timer on the owning loop and returns its id. Off the
    /// owning thread this rendezvouses with the loop, so the loop must be
    /// running.
    pub fn run_at(
        &self,
        deadline: Instant,
        interval: Duration,
        callback: impl Fn(&EventLoop, TimerId) + Send + 'static,
    ) -> TimerId {
        if thread::current().id() == self.shared.thread {
            match self.current_loop() {
                Some(event_loop) => return event_loop.run_at(deadline, interval, callback),
                None => panic!("event loop is gone"),
            }
        }

        let (tx, rx) = mpsc::channel();
        self.run_in_loop(move |event_loop| {
            let _ = tx.send(event_loop.run_at(deadline, interval, callback));
        });

        match rx.recv() {
            Ok(id) => id,
            Err(_) => panic!("event loop terminated before scheduling the timer"),
        }
    }

    /// Cancels a pending timer on the owning loop; false when it already
    /// fired. Off the owning thread this rendezvouses with the loop.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        if thread::current().id() == self.shared.thread {
            match self.current_loop() {
                Some(event_loop) => return event_loop.cancel_timer(id),
                None => panic!("event loop is gone"),
            }
        }

        let (tx, rx) = mpsc::channel();
        self.run_in_loop(move |event_loop| {
            let _ = tx.send(event_loop.cancel_timer(id));
        });

        match rx.recv() {
            Ok(cancelled) => cancelled,
            Err(_) => panic!("event loop terminated before cancelling the timer"),
        }
    }

    /// How many channels the loop's poller currently tracks. Maintained by
    /// the loop; used by least-connection balancing.
    pub fn channel_count(&self) -> usize {
        self.shared.channel_count.load(Ordering::Relaxed)
    }

    /// The per-loop key/value context.
    pub fn context(&self) -> &Context {
        &self.shared.context
    }

    fn current_loop(&self) -> Option<EventLoop> {
        CURRENT_LOOP.with(|current| {
            let inner = current.borrow().as_ref()?.upgrade()?;
            if Arc::ptr_eq(&inner.shared, &self.shared) {
                Some(EventLoop { inner })
            } else {
                None
            }
        })
    }
}

impl PartialEq for LoopHandle {
    fn eq(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for LoopHandle {}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "LoopHandle({})", self.shared.id)
    }
}
