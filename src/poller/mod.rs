//! Event-loop readiness polling: `Poller` is the contract the connection
//! engine drives; `epoll` and `kqueue` are the two backends selected at
//! compile time by `new()`.

use crate::error::{Error, Result};

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;

/// A raw file descriptor, as used throughout the poller and connection layers.
pub type Fd = std::os::unix::io::RawFd;

/// Reasons a descriptor can be reported closed by the poller itself (as
/// opposed to the connection engine deciding to close it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `EPOLLERR`/`EPOLLHUP` or the kqueue equivalent was observed.
    Error,
    /// The peer half-closed the stream (`EPOLLRDHUP`/`EV_EOF`).
    Eof,
}

/// Callback interface invoked from inside `Poller::run`. Implementations
/// must not block; they run on the shard's single event-loop thread.
pub trait PollHandler {
    fn on_readable(&mut self, fd: Fd);
    fn on_writable(&mut self, fd: Fd);
    fn on_close(&mut self, fd: Fd, reason: CloseReason);

    /// Called once per `run` iteration after the wake descriptor has been
    /// drained. Lets the handler service cross-thread work queued since the
    /// last wait (e.g. connections with writes enqueued from another
    /// thread) without waiting for their own readiness event.
    fn on_wake(&mut self) {}
}

/// Edge-triggered readiness multiplexer over a set of descriptors plus a
/// dedicated wake descriptor used to interrupt a blocking wait from another
/// thread.
pub trait Poller: Send + Sync {
    fn register(&self, fd: Fd, readable: bool, writable: bool) -> Result<()>;
    fn reregister(&self, fd: Fd, readable: bool, writable: bool) -> Result<()>;
    fn unregister(&self, fd: Fd) -> Result<()>;
    fn wake(&self) -> Result<()>;
    fn close(&self);
    fn run(&self, handler: &mut dyn PollHandler) -> Result<()>;
}

/// Constructs the compiled-in backend for this platform.
///
/// Returns `Error::PlatformUnsupported` on hosts with neither epoll nor
/// kqueue rather than silently degrading to level-triggered `poll(2)`.
#[cfg(target_os = "linux")]
pub fn new() -> Result<Box<dyn Poller>> {
    Ok(Box::new(epoll::EpollPoller::new()?))
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub fn new() -> Result<Box<dyn Poller>> {
    Ok(Box::new(kqueue::KqueuePoller::new()?))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
pub fn new() -> Result<Box<dyn Poller>> {
    Err(Error::PlatformUnsupported)
}
