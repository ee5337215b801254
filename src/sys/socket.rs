use std::io::{self, Error, ErrorKind};
use std::mem;
use std::net::{SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;

use libc::{self, c_int, c_void, socklen_t};

pub fn setsockopt<T>(fd: RawFd, opt: c_int, val: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        fd,
        opt,
        val,
        payload,
        mem::size_of::<T>() as libc::socklen_t
    ))?;
    Ok(())
}

pub fn getsockopt<T: Copy>(fd: RawFd, opt: c_int, val: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        opt,
        val,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    assert_eq!(len as usize, mem::size_of::<T>());
    Ok(slot)
}

/// Opens an AF_INET stream socket. Nonblocking sockets suit the readiness
/// poller; the completion poller leaves descriptors blocking so the ring,
/// not `errno`, carries readiness.
pub fn new_stream_socket(nonblocking: bool) -> io::Result<RawFd> {
    let mut ty = libc::SOCK_STREAM | libc::SOCK_CLOEXEC;
    if nonblocking {
        ty |= libc::SOCK_NONBLOCK;
    }

    let fd = syscall!(socket(libc::AF_INET, ty, 0))?;
    Ok(fd)
}

pub fn set_reuseport(fd: RawFd) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, 1 as c_int)
}

pub fn set_keepalive(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as c_int)
}

pub fn set_nodelay(fd: RawFd, on: bool) -> io::Result<()> {
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as c_int)
}

pub fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let raw: c_int = getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR)?;
    if raw == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(raw)))
    }
}

pub fn bind_v4(fd: RawFd, addr: SocketAddrV4) -> io::Result<()> {
    let sin = addr_to_sockaddr_in(addr);

    syscall!(bind(
        fd,
        &sin as *const _ as *const libc::sockaddr,
        mem::size_of::<libc::sockaddr_in>() as socklen_t
    ))?;
    Ok(())
}

pub fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    syscall!(listen(fd, backlog))?;
    Ok(())
}

/// Accepts one pending connection, retrying on `EINTR`. The accepted
/// descriptor is close-on-exec, and nonblocking when requested.
pub fn accept(fd: RawFd, nonblocking: bool) -> io::Result<(RawFd, SocketAddr)> {
    let mut flags = libc::SOCK_CLOEXEC;
    if nonblocking {
        flags |= libc::SOCK_NONBLOCK;
    }

    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;

    let accepted = loop {
        match syscall!(accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            flags
        )) {
            Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
            other => break other,
        }
    }?;

    let addr = sockaddr_to_addr(&storage, len as usize)?;
    Ok((accepted, addr))
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;

    syscall!(getpeername(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len
    ))?;

    sockaddr_to_addr(&storage, len as usize)
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;

    syscall!(getsockname(
        fd,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len
    ))?;

    sockaddr_to_addr(&storage, len as usize)
}

pub fn shutdown_write(fd: RawFd) -> io::Result<()> {
    syscall!(shutdown(fd, libc::SHUT_WR))?;
    Ok(())
}

pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = syscall!(write(fd, buf.as_ptr() as *const c_void, buf.len()))?;
    Ok(n as usize)
}

pub fn close(fd: RawFd) {
    let _ = syscall!(close(fd));
}

fn addr_to_sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.ip().octets()),
    };
    sin
}

pub fn sockaddr_to_addr(storage: &libc::sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let sin = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = sin.sin_addr.s_addr.to_ne_bytes();
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip.into(),
                u16::from_be(sin.sin_port),
            )))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "invalid argument")),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sockaddr_in_round_trip() {
        let addr: SocketAddrV4 = "192.168.1.9:4242".parse().unwrap();
        let sin = addr_to_sockaddr_in(addr);

        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        unsafe {
            std::ptr::copy_nonoverlapping(
                &sin as *const _ as *const u8,
                &mut storage as *mut _ as *mut u8,
                std::mem::size_of::<libc::sockaddr_in>(),
            );
        }

        let back = sockaddr_to_addr(&storage, std::mem::size_of::<libc::sockaddr_in>()).unwrap();
        assert_eq!(back, SocketAddr::V4(addr));
    }
}
