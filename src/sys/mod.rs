//! Platform glue: raw fd wrapper, socket option helpers, and the syscall
//! backends selected by `crate::poller`.

/// Calls a libc function and turns a `-1` return into `io::Result::Err`.
macro_rules! syscall {
    ($fn:ident $args:tt) => {{
        let res = unsafe { libc::$fn $args };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) use syscall;

pub mod fd;
pub mod socket;
