pub mod epoll;
pub mod eventfd;
pub mod fd;
pub mod socket;
pub mod timerfd;

pub use epoll::{Epoll, Events};
pub use eventfd::EventFd;
pub use timerfd::TimerFd;
