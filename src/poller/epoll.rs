use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use crate::error::{Error, Result};
use crate::sys::fd::FileDesc;
use crate::sys::syscall;

use super::{CloseReason, Fd, PollHandler, Poller};

const MAX_EVENTS: usize = 1024;

pub struct EpollPoller {
    epfd: FileDesc,
    wfd: FileDesc,
    closed: AtomicBool,
}

impl EpollPoller {
    pub fn new() -> Result<EpollPoller> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        let epfd = unsafe { FileDesc::new(epfd) };

        let wfd = syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC))?;
        let wfd = unsafe { FileDesc::new(wfd) };

        let mut ev = libc::epoll_event {
            events: (EPOLLIN | EPOLLET) as u32,
            u64: wfd.as_raw_fd() as u64,
        };
        syscall!(epoll_ctl(
            epfd.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            wfd.as_raw_fd(),
            &mut ev
        ))?;

        Ok(EpollPoller {
            epfd,
            wfd,
            closed: AtomicBool::new(false),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: Fd, readable: bool, writable: bool) -> Result<()> {
        let mut events = EPOLLET as u32;
        if readable {
            events |= (EPOLLIN | EPOLLRDHUP) as u32;
        }
        if writable {
            events |= EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        syscall!(epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev))?;
        Ok(())
    }
}

impl Poller for EpollPoller {
    fn register(&self, fd: Fd, readable: bool, writable: bool) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, readable, writable)
    }

    fn reregister(&self, fd: Fd, readable: bool, writable: bool) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, readable, writable)
    }

    fn unregister(&self, fd: Fd) -> Result<()> {
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, &mut ev))?;
        Ok(())
    }

    fn wake(&self) -> Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match syscall!(write(
            self.wfd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len()
        )) {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn run(&self, handler: &mut dyn PollHandler) -> Result<()> {
        let mut events: Vec<libc::epoll_event> = Vec::with_capacity(MAX_EVENTS);
        let wfd = self.wfd.as_raw_fd();

        while !self.closed.load(Ordering::SeqCst) {
            let n = match syscall!(epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                -1
            )) {
                Ok(n) => n,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "epoll_wait failed");
                    return Err(Error::Io(e));
                }
            };
            unsafe { events.set_len(n as usize) };

            for ev in &events {
                let fd = ev.u64 as Fd;
                let flags = ev.events as i32;

                if fd == wfd {
                    drain_wake_fd(wfd);
                    handler.on_wake();
                    continue;
                }

                if flags & (EPOLLERR | EPOLLHUP) != 0 {
                    handler.on_close(fd, CloseReason::Error);
                    continue;
                }
                if flags & EPOLLIN != 0 {
                    handler.on_readable(fd);
                }
                if flags & EPOLLOUT != 0 {
                    handler.on_writable(fd);
                }
                if flags & EPOLLRDHUP != 0 {
                    handler.on_close(fd, CloseReason::Eof);
                }
            }
        }
        Ok(())
    }
}

fn drain_wake_fd(wfd: Fd) {
    let mut buf = [0u8; 8];
    loop {
        let res = syscall!(read(wfd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()));
        match res {
            Ok(_) => continue,
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => break,
            Err(_) => break,
        }
    }
}
