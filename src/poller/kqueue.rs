use std::mem;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::{EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_CLEAR, EV_DELETE, EV_EOF};

use crate::error::{Error, Result};
use crate::sys::fd::FileDesc;
use crate::sys::syscall;

use super::{CloseReason, Fd, PollHandler, Poller};

const MAX_EVENTS: usize = 1024;

pub struct KqueuePoller {
    kq: FileDesc,
    rfd: FileDesc,
    wfd: FileDesc,
    closed: AtomicBool,
}

impl KqueuePoller {
    pub fn new() -> Result<KqueuePoller> {
        let kq = syscall!(kqueue())?;
        let kq = unsafe { FileDesc::new(kq) };

        let mut fds = [0 as libc::c_int; 2];
        syscall!(pipe(fds.as_mut_ptr()))?;
        let rfd = unsafe { FileDesc::new(fds[0]) };
        let wfd = unsafe { FileDesc::new(fds[1]) };
        crate::sys::socket::set_nonblocking(rfd.as_raw_fd(), true)?;
        crate::sys::socket::set_nonblocking(wfd.as_raw_fd(), true)?;

        let wake_ev = make_kevent(rfd.as_raw_fd() as u64, EVFILT_READ, EV_ADD | EV_CLEAR);
        submit(kq.as_raw_fd(), &[wake_ev])?;

        Ok(KqueuePoller {
            kq,
            rfd,
            wfd,
            closed: AtomicBool::new(false),
        })
    }
}

fn make_kevent(ident: u64, filter: i16, flags: u16) -> libc::kevent {
    libc::kevent {
        ident: ident as libc::uintptr_t,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: std::ptr::null_mut(),
    }
}

fn submit(kq: Fd, changes: &[libc::kevent]) -> Result<()> {
    if changes.is_empty() {
        return Ok(());
    }
    syscall!(kevent(
        kq,
        changes.as_ptr(),
        changes.len() as i32,
        std::ptr::null_mut(),
        0,
        std::ptr::null()
    ))?;
    Ok(())
}

impl Poller for KqueuePoller {
    fn register(&self, fd: Fd, readable: bool, writable: bool) -> Result<()> {
        let mut changes = Vec::with_capacity(2);
        if readable {
            changes.push(make_kevent(fd as u64, EVFILT_READ, EV_ADD | EV_CLEAR));
        }
        if writable {
            changes.push(make_kevent(fd as u64, EVFILT_WRITE, EV_ADD | EV_CLEAR));
        }
        submit(self.kq.as_raw_fd(), &changes)
    }

    /// kqueue has no direct "modify interest" call; this is emulated as an
    /// unconditional delete of both filters followed by an add of the ones
    /// that are still wanted.
    ///
    /// The delete of a filter that was never registered (the common case —
    /// connections start read-only, so toggling on write interest always
    /// deletes an absent `EVFILT_WRITE`) fails for that entry, and `submit`
    /// passes a null output eventlist, so the kernel has nowhere to report
    /// which entries failed. On at least some BSD kqueue implementations a
    /// failing entry aborts the rest of the batch, which would silently
    /// drop the trailing `EV_ADD`. TODO: pass a sized output eventlist to
    /// `submit` here and retry the `EV_ADD`s whose `EV_DELETE` failed.
    fn reregister(&self, fd: Fd, readable: bool, writable: bool) -> Result<()> {
        let mut changes = vec![
            make_kevent(fd as u64, EVFILT_READ, EV_DELETE),
            make_kevent(fd as u64, EVFILT_WRITE, EV_DELETE),
        ];
        if readable {
            changes.push(make_kevent(fd as u64, EVFILT_READ, EV_ADD | EV_CLEAR));
        }
        if writable {
            changes.push(make_kevent(fd as u64, EVFILT_WRITE, EV_ADD | EV_CLEAR));
        }
        submit(self.kq.as_raw_fd(), &changes)
    }

    fn unregister(&self, fd: Fd) -> Result<()> {
        let changes = [
            make_kevent(fd as u64, EVFILT_READ, EV_DELETE),
            make_kevent(fd as u64, EVFILT_WRITE, EV_DELETE),
        ];
        submit(self.kq.as_raw_fd(), &changes)
    }

    fn wake(&self) -> Result<()> {
        let buf = [1u8];
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
        let mut events: Vec<libc::kevent> = Vec::with_capacity(MAX_EVENTS);
        for _ in 0..MAX_EVENTS {
            events.push(unsafe { mem::zeroed() });
        }
        let rfd = self.rfd.as_raw_fd();

        while !self.closed.load(Ordering::SeqCst) {
            let n = match syscall!(kevent(
                self.kq.as_raw_fd(),
                std::ptr::null(),
                0,
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                std::ptr::null()
            )) {
                Ok(n) => n,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "kevent wait failed");
                    return Err(Error::Io(e));
                }
            };

            for ev in &events[..n as usize] {
                let fd = ev.ident as Fd;

                if fd == rfd {
                    drain_wake_fd(rfd);
                    handler.on_wake();
                    continue;
                }

                let eof = ev.flags & EV_EOF != 0;
                match ev.filter {
                    EVFILT_READ => {
                        handler.on_readable(fd);
                        if eof {
                            handler.on_close(fd, CloseReason::Eof);
                        }
                    }
                    EVFILT_WRITE => {
                        handler.on_writable(fd);
                    }
                    _ => {
                        if eof {
                            handler.on_close(fd, CloseReason::Eof);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn drain_wake_fd(rfd: Fd) {
    let mut buf = [0u8; 16];
    loop {
        let res = syscall!(read(rfd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()));
        match res {
            Ok(_) => continue,
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => break,
            Err(_) => break,
        }
    }
}
