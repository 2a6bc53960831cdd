//! Thin wrappers over the libc surface the engine needs: listener setup,
//! accept, non-blocking reads/writes, the platform poller, and the wake pipe.
//! All unsafe lives here.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::ptr;

use libc::{c_int, c_void, socklen_t};

use crate::error::{MazurkaError, MazurkaResult};

/// Listener socket options, in order of preference. The first one the kernel
/// accepts wins; load-balanced port sharing where available, plain address
/// reuse as the floor.
#[cfg(target_os = "freebsd")]
const REUSE_PREFERENCE: &[c_int] = &[libc::SO_REUSEPORT_LB, libc::SO_REUSEPORT, libc::SO_REUSEADDR];
#[cfg(not(target_os = "freebsd"))]
const REUSE_PREFERENCE: &[c_int] = &[libc::SO_REUSEPORT, libc::SO_REUSEADDR];

/// Create a non-blocking, close-on-exec TCP listener bound to `host:port`.
/// Each worker creates its own so accepted connections balance across them.
pub fn create_listen_socket(host: &str, port: u16, backlog: i32) -> MazurkaResult<c_int> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|_| MazurkaError::Addr(format!("{}:{}", host, port)))?;

    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    let fd = new_stream_socket(domain)?;

    let mut reuse_ok = false;
    for opt in REUSE_PREFERENCE {
        if set_opt(fd, libc::SOL_SOCKET, *opt, 1) {
            reuse_ok = true;
            break;
        }
    }
    if !reuse_ok {
        let err = io::Error::last_os_error();
        close_fd(fd);
        return Err(err.into());
    }

    if let Err(err) = bind_addr(fd, &addr) {
        close_fd(fd);
        return Err(err.into());
    }

    unsafe {
        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            close_fd(fd);
            return Err(err.into());
        }
    }

    Ok(fd)
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
fn new_stream_socket(domain: c_int) -> MazurkaResult<c_int> {
    unsafe {
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(fd)
    }
}

#[cfg(target_os = "macos")]
fn new_stream_socket(domain: c_int) -> MazurkaResult<c_int> {
    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if let Err(err) = set_nonblocking(fd) {
            close_fd(fd);
            return Err(err.into());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            let err = io::Error::last_os_error();
            close_fd(fd);
            return Err(err.into());
        }
        // No MSG_NOSIGNAL on macOS; suppress SIGPIPE per socket instead.
        set_opt(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1);
        Ok(fd)
    }
}

fn set_opt(fd: c_int, level: c_int, opt: c_int, value: c_int) -> bool {
    unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &value as *const _ as *const c_void,
            mem::size_of_val(&value) as socklen_t,
        ) == 0
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> io::Result<()> {
    unsafe {
        let res = match addr {
            SocketAddr::V4(a) => {
                #[cfg(any(target_os = "macos", target_os = "freebsd"))]
                let sin = libc::sockaddr_in {
                    sin_len: mem::size_of::<libc::sockaddr_in>() as u8,
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                #[cfg(target_os = "linux")]
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            SocketAddr::V6(a) => {
                #[cfg(any(target_os = "macos", target_os = "freebsd"))]
                let sin6 = libc::sockaddr_in6 {
                    sin6_len: mem::size_of::<libc::sockaddr_in6>() as u8,
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                #[cfg(target_os = "linux")]
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Accept one pending connection. `Ok(None)` when the queue is empty.
pub fn accept_connection(listen_fd: c_int) -> io::Result<Option<c_int>> {
    #[cfg(any(target_os = "linux", target_os = "freebsd"))]
    unsafe {
        loop {
            let fd = libc::accept4(
                listen_fd,
                ptr::null_mut(),
                ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            );
            if fd >= 0 {
                return Ok(Some(fd));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(None),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
    }

    #[cfg(target_os = "macos")]
    unsafe {
        loop {
            let fd = libc::accept(listen_fd, ptr::null_mut(), ptr::null_mut());
            if fd >= 0 {
                if let Err(err) = set_nonblocking(fd) {
                    close_fd(fd);
                    return Err(err);
                }
                set_opt(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1);
                return Ok(Some(fd));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(None),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
    }
}

pub fn set_nodelay(fd: c_int) -> io::Result<()> {
    if set_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, 1) {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

pub fn set_nonblocking(fd: c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Port the socket actually bound to (port 0 requests resolve here).
pub fn local_port(fd: c_int) -> io::Result<u16> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error());
        }
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin: &libc::sockaddr_in = &*(&storage as *const _ as *const libc::sockaddr_in);
                Ok(u16::from_be(sin.sin_port))
            }
            libc::AF_INET6 => {
                let sin6: &libc::sockaddr_in6 =
                    &*(&storage as *const _ as *const libc::sockaddr_in6);
                Ok(u16::from_be(sin6.sin6_port))
            }
            _ => Err(io::Error::new(io::ErrorKind::Other, "unknown address family")),
        }
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

/// One step of non-blocking I/O.
#[derive(Debug, PartialEq, Eq)]
pub enum IoStep {
    /// The syscall transferred this many bytes (0 on read means EOF).
    Ready(usize),
    /// Nothing to do yet; stay armed.
    WouldBlock,
}

pub fn read_step(fd: c_int, buf: &mut [u8]) -> io::Result<IoStep> {
    loop {
        let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if res >= 0 {
            return Ok(IoStep::Ready(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(IoStep::WouldBlock),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;
#[cfg(target_os = "macos")]
const SEND_FLAGS: c_int = 0;

pub fn write_step(fd: c_int, buf: &[u8]) -> io::Result<IoStep> {
    loop {
        let res = unsafe { libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), SEND_FLAGS) };
        if res >= 0 {
            return Ok(IoStep::Ready(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(IoStep::WouldBlock),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err),
        }
    }
}

// ---- Wake pipe ----

/// Non-blocking pipe used to interrupt a poll wait from another thread.
/// Returns `(read_fd, write_fd)`.
pub fn create_pipe() -> io::Result<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    for fd in fds {
        if let Err(err) = set_nonblocking(fd) {
            close_fd(fds[0]);
            close_fd(fds[1]);
            return Err(err);
        }
    }
    Ok((fds[0], fds[1]))
}

/// Write one byte into the wake pipe. A full pipe already guarantees a
/// pending wakeup, so EAGAIN is success.
pub fn pipe_wake(write_fd: c_int) {
    let byte = [1u8];
    unsafe {
        libc::write(write_fd, byte.as_ptr() as *const c_void, 1);
    }
}

/// Drain every pending byte from the wake pipe.
pub fn pipe_drain(read_fd: c_int) {
    let mut sink = [0u8; 64];
    loop {
        let res = unsafe { libc::read(read_fd, sink.as_mut_ptr() as *mut c_void, sink.len()) };
        if res <= 0 {
            return;
        }
    }
}

// ---- Poller (Linux epoll) ----

#[cfg(target_os = "linux")]
pub use linux_poll::*;

#[cfg(target_os = "linux")]
mod linux_poll {
    use super::*;
    pub use libc::epoll_event;
    pub use libc::{EPOLLIN, EPOLLOUT};

    pub struct Poller {
        fd: c_int,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            unsafe {
                let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(Self { fd })
            }
        }

        /// Register a descriptor. One-shot registrations deliver a single
        /// event and disarm, which is the completion contract; re-arm with
        /// `modify`.
        pub fn add(&self, fd: c_int, token: u64, interest: i32, oneshot: bool) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest, oneshot)
        }

        pub fn modify(&self, fd: c_int, token: u64, interest: i32, oneshot: bool) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest, oneshot)
        }

        fn ctl(
            &self,
            op: c_int,
            fd: c_int,
            token: u64,
            interest: i32,
            oneshot: bool,
        ) -> io::Result<()> {
            let mut flags = interest;
            if oneshot {
                flags |= libc::EPOLLONESHOT;
            }
            let mut event = epoll_event {
                events: flags as u32,
                u64: token,
            };
            unsafe {
                if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }

        pub fn delete(&self, fd: c_int) -> io::Result<()> {
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ENOENT) {
                        return Err(err);
                    }
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
            unsafe {
                let res = libc::epoll_wait(
                    self.fd,
                    events.as_mut_ptr(),
                    events.len() as c_int,
                    timeout_ms,
                );
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err);
                }
                Ok(res as usize)
            }
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            close_fd(self.fd);
        }
    }
}

// ---- Poller (kqueue for macOS / BSD) ----

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
pub use kqueue_poll::*;

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
mod kqueue_poll {
    use super::*;
    use libc::{kevent, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_DELETE, EV_ENABLE, EV_ONESHOT};

    #[allow(non_camel_case_types)]
    #[derive(Clone, Copy)]
    pub struct epoll_event {
        pub events: u32,
        pub u64: u64,
    }

    pub const EPOLLIN: i32 = 1;
    pub const EPOLLOUT: i32 = 4;

    pub struct Poller {
        fd: c_int,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            unsafe {
                let fd = libc::kqueue();
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(Self { fd })
            }
        }

        pub fn add(&self, fd: c_int, token: u64, interest: i32, oneshot: bool) -> io::Result<()> {
            self.apply(fd, token, interest, oneshot, EV_ADD | EV_ENABLE)
        }

        pub fn modify(&self, fd: c_int, token: u64, interest: i32, oneshot: bool) -> io::Result<()> {
            self.apply(fd, token, interest, oneshot, EV_ADD | EV_ENABLE)
        }

        pub fn delete(&self, fd: c_int) -> io::Result<()> {
            let _ = self.apply(fd, 0, EPOLLIN | EPOLLOUT, false, EV_DELETE);
            Ok(())
        }

        fn apply(
            &self,
            fd: c_int,
            token: u64,
            interest: i32,
            oneshot: bool,
            action: u16,
        ) -> io::Result<()> {
            let mut changes: [kevent; 2] = unsafe { [mem::zeroed(), mem::zeroed()] };
            let mut n = 0usize;
            let mut flags = action;
            if oneshot {
                flags |= EV_ONESHOT;
            }

            if (interest & EPOLLIN) != 0 {
                changes[n].ident = fd as libc::uintptr_t;
                changes[n].filter = EVFILT_READ;
                changes[n].flags = flags;
                changes[n].udata = token as *mut c_void;
                n += 1;
            }
            if (interest & EPOLLOUT) != 0 {
                changes[n].ident = fd as libc::uintptr_t;
                changes[n].filter = EVFILT_WRITE;
                changes[n].flags = flags;
                changes[n].udata = token as *mut c_void;
                n += 1;
            }

            unsafe {
                let res = libc::kevent(
                    self.fd,
                    changes.as_ptr(),
                    n as c_int,
                    ptr::null_mut(),
                    0,
                    ptr::null(),
                );
                if res < 0 && action != EV_DELETE {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
            const MAX_BATCH: usize = 256;
            let mut kevents: [kevent; MAX_BATCH] = unsafe { mem::zeroed() };
            let batch = events.len().min(MAX_BATCH);

            let ts = libc::timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
            };
            let ts_ptr = if timeout_ms >= 0 {
                &ts as *const libc::timespec
            } else {
                ptr::null()
            };

            unsafe {
                let res = libc::kevent(
                    self.fd,
                    ptr::null(),
                    0,
                    kevents.as_mut_ptr(),
                    batch as c_int,
                    ts_ptr,
                );
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err);
                }

                let n = res as usize;
                for i in 0..n {
                    let mut ev = 0;
                    if kevents[i].filter == EVFILT_READ {
                        ev |= EPOLLIN;
                    }
                    if kevents[i].filter == EVFILT_WRITE {
                        ev |= EPOLLOUT;
                    }
                    events[i] = epoll_event {
                        events: ev as u32,
                        u64: kevents[i].udata as u64,
                    };
                }
                Ok(n)
            }
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            close_fd(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_binds_and_reports_port() {
        let fd = create_listen_socket("127.0.0.1", 0, 8).unwrap();
        let port = local_port(fd).unwrap();
        assert!(port > 0);
        close_fd(fd);
    }

    #[test]
    fn bad_address_is_rejected() {
        assert!(create_listen_socket("not-an-ip", 0, 8).is_err());
    }

    #[test]
    fn pipe_wakes_and_drains() {
        let (rfd, wfd) = create_pipe().unwrap();
        pipe_wake(wfd);
        pipe_wake(wfd);
        let mut buf = [0u8; 8];
        assert!(matches!(read_step(rfd, &mut buf), Ok(IoStep::Ready(n)) if n >= 1));
        pipe_drain(rfd);
        assert_eq!(read_step(rfd, &mut buf).unwrap(), IoStep::WouldBlock);
        close_fd(rfd);
        close_fd(wfd);
    }
}
