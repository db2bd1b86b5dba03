//! Non-blocking socket construction and the handful of socket options the
//! listener and connection engine need: SO_REUSEADDR/SO_REUSEPORT,
//! TCP_NODELAY, SO_RCVBUF/SO_SNDBUF, and non-blocking `accept4`.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{c_int, c_void, sockaddr, socklen_t};

use super::fd::FileDesc;
use super::syscall;

fn setsockopt<T>(fd: RawFd, level: c_int, name: c_int, value: T) -> io::Result<()> {
    let payload = &value as *const T as *const c_void;
    syscall!(setsockopt(
        fd,
        level,
        name,
        payload,
        mem::size_of::<T>() as socklen_t
    ))?;
    Ok(())
}

fn getsockopt<T: Copy>(fd: RawFd, level: c_int, name: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(
        fd,
        level,
        name,
        &mut slot as *mut T as *mut c_void,
        &mut len
    ))?;
    Ok(slot)
}

pub fn set_reuseaddr(fd: RawFd, enable: bool) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, enable as c_int)
}

/// Returns `Ok(())` on success. `listen_tcp` treats a failure here as
/// non-fatal and logs a warning instead of failing startup, since platforms
/// lacking SO_REUSEPORT should still get a working single-listener server.
pub fn set_reuseport(fd: RawFd, enable: bool) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, enable as c_int)
}

pub fn set_nodelay(fd: RawFd, enable: bool) -> io::Result<()> {
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, enable as c_int)
}

pub fn set_recv_buf(fd: RawFd, bytes: usize) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, bytes as c_int)
}

pub fn set_send_buf(fd: RawFd, bytes: usize) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, bytes as c_int)
}

pub fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let raw: c_int = getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR)?;
    if raw == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(raw)))
    }
}

pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    syscall!(fcntl(fd, libc::F_SETFL, flags))?;
    Ok(())
}

/// Opens a non-blocking TCP listener bound to `addr` with SO_REUSEADDR
/// always set and SO_REUSEPORT set when `reuse_port` is true.
pub fn listen_tcp(addr: &SocketAddr, reuse_port: bool, backlog: i32) -> io::Result<FileDesc> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let raw_fd = syscall!(socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0))?;
    let fd = unsafe { FileDesc::new(raw_fd) };

    set_reuseaddr(fd.as_raw_fd(), true)?;
    if reuse_port {
        if let Err(e) = set_reuseport(fd.as_raw_fd(), true) {
            // SO_REUSEPORT is absent on some hosts (e.g. older kernels);
            // degrade to a single shared listener rather than failing
            // startup, matching `Config::reuse_port`'s documented fallback.
            tracing::warn!(error = %e, "SO_REUSEPORT unsupported, falling back to a single listener");
        }
    }
    set_nonblocking(fd.as_raw_fd(), true)?;

    let (sockaddr, len) = socket_addr_to_raw(addr);
    syscall!(bind(fd.as_raw_fd(), &sockaddr as *const _ as *const sockaddr, len))?;
    syscall!(listen(fd.as_raw_fd(), backlog))?;

    Ok(fd)
}

/// Non-blocking `accept4(SOCK_NONBLOCK | SOCK_CLOEXEC)`, falling back to
/// `accept` + separate non-blocking/cloexec calls on platforms where
/// `accept4` is unavailable (`ENOSYS`).
pub fn accept_nonblocking(listener_fd: RawFd) -> io::Result<Option<FileDesc>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;

    let res = syscall!(accept4(
        listener_fd,
        &mut storage as *mut _ as *mut sockaddr,
        &mut len,
        libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
    ));

    let raw_fd = match res {
        Ok(fd) => fd,
        Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => return Ok(None),
        Err(e) if e.raw_os_error() == Some(libc::ENOSYS) => {
            let res = syscall!(accept(
                listener_fd,
                &mut storage as *mut _ as *mut sockaddr,
                &mut len
            ));
            match res {
                Ok(fd) => {
                    set_nonblocking(fd, true)?;
                    fd
                }
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
        Err(e) => return Err(e),
    };

    Ok(Some(unsafe { FileDesc::new(raw_fd) }))
}

/// Reads the remote address of a connected socket via `getpeername`.
pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;
    syscall!(getpeername(
        fd,
        &mut storage as *mut _ as *mut sockaddr,
        &mut len
    ))?;
    raw_to_socket_addr(&storage)
}

/// Reads the locally bound address of a socket via `getsockname`. Used to
/// discover the OS-assigned port after binding to port 0.
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;
    syscall!(getsockname(
        fd,
        &mut storage as *mut _ as *mut sockaddr,
        &mut len
    ))?;
    raw_to_socket_addr(&storage)
}

fn raw_to_socket_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            // `s_addr` holds the address octets in network byte order already;
            // go through `to_ne_bytes` (a memory-order reinterpret, not a
            // swap) rather than treating the field as a big-endian integer.
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            let port = u16::from_be(sin.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            let port = u16::from_be(sin6.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported address family",
        )),
    }
}

fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}
