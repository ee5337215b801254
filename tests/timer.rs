use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use hive_io::EventLoop;

#[test]
fn cancelled_timer_never_fires() {
    let event_loop = EventLoop::new().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let id = {
        let fired = Arc::clone(&fired);
        event_loop.run_at(
            Instant::now() + Duration::from_millis(100),
            Duration::ZERO,
            move |_, _| {
                fired.fetch_add(1, Ordering::SeqCst);
            },
        )
    };

    let handle = event_loop.handle();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        assert!(handle.cancel_timer(id));

        thread::sleep(Duration::from_millis(150));
        handle.stop();
    });

    event_loop.run().unwrap();
    canceller.join().unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn cancel_after_firing_reports_false() {
    let event_loop = EventLoop::new().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let id = {
        let fired = Arc::clone(&fired);
        event_loop.run_at(Instant::now(), Duration::ZERO, move |event_loop, _| {
            fired.fetch_add(1, Ordering::SeqCst);
            event_loop.handle().stop();
        })
    };

    event_loop.run().unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!event_loop.cancel_timer(id));
}

#[test]
fn periodic_timer_fires_repeatedly() {
    let event_loop = EventLoop::new().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    {
        let fired = Arc::clone(&fired);
        event_loop.run_at(
            Instant::now(),
            Duration::from_millis(50),
            move |event_loop, id| {
                let count = fired.fetch_add(1, Ordering::SeqCst) + 1;

                if count == 4 {
                    assert!(event_loop.cancel_timer(id));
                    event_loop.handle().stop();
                }
            },
        );
    }

    event_loop.run().unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 4);
    // First tick immediately, then one per interval.
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[test]
fn functors_run_on_the_loop_thread_in_order() {
    let event_loop = EventLoop::new().unwrap();
    let loop_thread = thread::current().id();

    let handle = event_loop.handle();
    let (tx, rx) = mpsc::channel();

    let poster = thread::spawn(move || {
        for i in 0..3 {
            let tx = tx.clone();
            handle.run_in_loop(move |_| {
                tx.send((i, thread::current().id())).unwrap();
            });
        }
        handle.stop();
    });

    event_loop.run().unwrap();
    poster.join().unwrap();

    let mut order = Vec::new();
    while let Ok((i, thread_id)) = rx.try_recv() {
        assert_eq!(thread_id, loop_thread);
        order.push(i);
    }
    assert_eq!(order, vec![0, 1, 2]);
}

#[test]
fn run_in_loop_is_synchronous_on_the_loop_thread() {
    let event_loop = EventLoop::new().unwrap();

    let ran = Arc::new(AtomicBool::new(false));
    {
        let ran = Arc::clone(&ran);
        let handle = event_loop.handle();

        event_loop.run_at(Instant::now(), Duration::ZERO, move |event_loop, _| {
            let ran_inner = Arc::clone(&ran);
            handle.run_in_loop(move |_| {
                ran_inner.store(true, Ordering::SeqCst);
            });

            // Same thread, loop running: the functor ran before the call
            // returned.
            assert!(ran.load(Ordering::SeqCst));
            event_loop.handle().stop();
        });
    }

    event_loop.run().unwrap();
    assert!(ran.load(Ordering::SeqCst));
}
