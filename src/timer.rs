use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::TimerFd;

/// Identifies one pending timer within its owning loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

pub(crate) type TimerCallback = Rc<dyn Fn(&EventLoop, TimerId)>;

pub(crate) struct TimerEntry {
    id: u64,
    deadline: Instant,
    interval: Duration,
    callback: TimerCallback,
}

// BinaryHeap is a max-heap; the ordering is reversed so the earliest
// deadline sits at the root, ties broken by the smaller id.
impl Ord for TimerEntry {
    fn cmp(&self, other: &TimerEntry) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &TimerEntry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &TimerEntry) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}

impl Eq for TimerEntry {}

/// The ordered set of pending timers for one loop, armed through a single
/// timerfd that is always set to the heap root's deadline.
pub(crate) struct TimerQueue {
    timerfd: TimerFd,
    channel: Rc<RefCell<Channel>>,
    heap: BinaryHeap<TimerEntry>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new(nonblocking: bool) -> io::Result<TimerQueue> {
        let timerfd = TimerFd::new(nonblocking)?;

        let mut channel = Channel::new(timerfd.as_raw_fd());
        channel.set_read_callback(Rc::new(|event_loop: &EventLoop| {
            event_loop.handle_timer_tick()
        }));
        channel.enable_read(false);

        Ok(TimerQueue {
            timerfd,
            channel: Rc::new(RefCell::new(channel)),
            heap: BinaryHeap::new(),
            next_id: 0,
        })
    }

    pub fn channel(&self) -> Rc<RefCell<Channel>> {
        Rc::clone(&self.channel)
    }

    /// Schedules `callback` for `deadline`, then every `interval` after
    /// that when `interval` is nonzero. Re-arms the fd only when the new
    /// entry became the root.
    pub fn add_timer(
        &mut self,
        deadline: Instant,
        interval: Duration,
        callback: TimerCallback,
    ) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;

        self.heap.push(TimerEntry {
            id,
            deadline,
            interval,
            callback,
        });

        if self.heap.peek().map(|root| root.id) == Some(id) {
            self.arm();
        }

        TimerId(id)
    }

    /// Removes a pending timer. Returns false when it already fired (or
    /// never existed); a periodic timer mid-callback has already been
    /// reinserted and cancels normally.
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.id != id.0);
        self.heap.len() != before
    }

    /// Drains the expiry counter (readiness mode; in completion mode the
    /// poller's read already consumed it).
    pub fn drain_fd(&self) {
        let _ = self.timerfd.read();
    }

    /// Pops every entry whose deadline has passed — each at most once per
    /// tick — reinserts periodic entries advanced by exactly one interval,
    /// and re-arms the fd to the new root. A reinserted entry still in the
    /// past fires on the next loop iteration; missed ticks coalesce rather
    /// than replay.
    pub fn take_expired(&mut self) -> Vec<TimerEntry> {
        let now = Instant::now();
        let mut expired = Vec::new();

        while let Some(root) = self.heap.peek() {
            if root.deadline > now {
                break;
            }

            expired.push(self.heap.pop().unwrap());
        }

        for entry in &expired {
            if !entry.interval.is_zero() {
                self.heap.push(TimerEntry {
                    id: entry.id,
                    deadline: entry.deadline + entry.interval,
                    interval: entry.interval,
                    callback: Rc::clone(&entry.callback),
                });
            }
        }

        if !self.heap.is_empty() {
            self.arm();
        }

        expired
    }

    // Arms the fd with the time left until the root deadline, clamped to
    // one nanosecond: settime(0) would disarm, while an overdue root must
    // fire immediately.
    fn arm(&self) {
        let root = match self.heap.peek() {
            Some(root) => root,
            None => return,
        };

        let mut value = root.deadline.saturating_duration_since(Instant::now());
        if value.is_zero() {
            value = Duration::from_nanos(1);
        }

        if let Err(e) = self.timerfd.settime(value, Duration::ZERO) {
            panic!("timerfd_settime: {}", e);
        }
    }
}

impl TimerEntry {
    pub fn id(&self) -> TimerId {
        TimerId(self.id)
    }

    pub fn callback(&self) -> TimerCallback {
        Rc::clone(&self.callback)
    }
}

#[cfg(test)]
mod test {
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    use super::{TimerEntry, TimerQueue};

    fn entry(id: u64, deadline: Instant) -> TimerEntry {
        TimerEntry {
            id,
            deadline,
            interval: Duration::ZERO,
            callback: Rc::new(|_, _| {}),
        }
    }

    #[test]
    fn earliest_deadline_pops_first() {
        let mut heap = std::collections::BinaryHeap::new();
        let base = Instant::now();

        heap.push(entry(0, base + Duration::from_millis(30)));
        heap.push(entry(1, base + Duration::from_millis(10)));
        heap.push(entry(2, base + Duration::from_millis(20)));

        assert_eq!(heap.pop().unwrap().id, 1);
        assert_eq!(heap.pop().unwrap().id, 2);
        assert_eq!(heap.pop().unwrap().id, 0);
    }

    #[test]
    fn equal_deadlines_pop_in_id_order() {
        let mut heap = std::collections::BinaryHeap::new();
        let deadline = Instant::now() + Duration::from_millis(5);

        heap.push(entry(2, deadline));
        heap.push(entry(0, deadline));
        heap.push(entry(1, deadline));

        assert_eq!(heap.pop().unwrap().id, 0);
        assert_eq!(heap.pop().unwrap().id, 1);
        assert_eq!(heap.pop().unwrap().id, 2);
    }

    #[test]
    fn expired_entries_come_back_in_order() {
        let mut queue = TimerQueue::new(true).unwrap();
        let past = Instant::now() - Duration::from_millis(10);

        let first = queue.add_timer(past, Duration::ZERO, Rc::new(|_, _| {}));
        let second = queue.add_timer(past + Duration::from_millis(1), Duration::ZERO, Rc::new(|_, _| {}));
        let future = queue.add_timer(
            Instant::now() + Duration::from_secs(3600),
            Duration::ZERO,
            Rc::new(|_, _| {}),
        );

        let expired = queue.take_expired();
        let ids: Vec<_> = expired.iter().map(|e| e.id()).collect();

        assert_eq!(ids, vec![first, second]);
        assert!(queue.cancel_timer(future));
    }

    #[test]
    fn cancel_reports_removal() {
        let mut queue = TimerQueue::new(true).unwrap();
        let soon = Instant::now() + Duration::from_secs(60);

        let id = queue.add_timer(soon, Duration::ZERO, Rc::new(|_, _| {}));

        assert!(queue.cancel_timer(id));
        assert!(!queue.cancel_timer(id));
    }

    #[test]
    fn periodic_entry_is_reinserted() {
        let mut queue = TimerQueue::new(true).unwrap();
        let past = Instant::now() - Duration::from_millis(1);

        let id = queue.add_timer(past, Duration::from_secs(3600), Rc::new(|_, _| {}));

        let expired = queue.take_expired();
        assert_eq!(expired.len(), 1);

        // Advanced by one interval and pending again.
        assert!(queue.cancel_timer(id));
    }
}
