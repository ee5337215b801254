use std::cell::Cell;
use std::time::{Duration, Instant};

use hive_io::EventLoop;

fn main() {
    env_logger::init();

    let event_loop = EventLoop::new().unwrap();

    let ticks = Cell::new(0);
    event_loop.run_at(Instant::now(), Duration::from_secs(1), move |event_loop, id| {
        ticks.set(ticks.get() + 1);
        println!("tick {} from timer {:?}", ticks.get(), id);

        if ticks.get() == 5 {
            event_loop.cancel_timer(id);
            event_loop.handle().stop();
        }
    });

    event_loop.run().unwrap();
}
