//! Networking collaborator: socket operations on raw descriptors.
//!
//! Socket descriptors are wire-visible: the target holds them as 16-bit
//! integers and hands them back for every later call, so sockets do not
//! live behind Rust ownership here. Creation goes through `std::net` for
//! address resolution, then the descriptor is detached and used raw.

#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket};
use std::os::fd::{IntoRawFd, RawFd};

/// Result of accepting one client on a bound socket.
///
/// For TCP, `bind_fd` is the unchanged listening descriptor. For UDP the
/// descriptors swap: the previously bound descriptor becomes the client
/// descriptor (connected to the peer of the next queued datagram) and a
/// fresh socket bound to the same local address takes over accepting.
#[derive(Debug)]
pub struct Accepted {
    /// Descriptor that keeps accepting new clients.
    pub bind_fd: RawFd,
    /// Descriptor connected to the accepted client.
    pub client_fd: RawFd,
    /// Raw peer address bytes: 4 for IPv4, 16 for IPv6.
    pub peer_addr: Vec<u8>,
}

/// Resolves `host:port` to the first usable socket address.
fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
    })
}

/// Opens a socket: bind or connect, TCP or UDP. The port is given as the
/// decimal string the target sent.
///
/// # Errors
///
/// `InvalidInput` for an unparsable port, otherwise whatever resolution,
/// bind, or connect reports.
pub fn open(host: &str, port: &str, udp: bool, bind: bool) -> io::Result<RawFd> {
    let port: u16 = port
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid port string"))?;
    let fd = match (udp, bind) {
        (false, false) => TcpStream::connect((host, port))?.into_raw_fd(),
        (false, true) => TcpListener::bind((host, port))?.into_raw_fd(),
        (true, true) => udp_bind(&resolve(host, port)?)?,
        (true, false) => {
            let remote = resolve(host, port)?;
            let local = if remote.is_ipv4() {
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
            } else {
                SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
            };
            let socket = UdpSocket::bind(local)?;
            socket.connect(remote)?;
            socket.into_raw_fd()
        }
    };
    Ok(fd)
}

/// Binds a UDP socket with `SO_REUSEADDR` set before the bind.
///
/// The flag is required up front: the UDP accept path later binds a
/// replacement socket to this same local address while this one is still
/// open, and the kernel only permits that when both carry the flag.
fn udp_bind(addr: &SocketAddr) -> io::Result<RawFd> {
    let family = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    // SAFETY: plain socket(2) call.
    let fd = unsafe { libc::socket(family, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let one: libc::c_int = 1;
    // SAFETY: one is a valid c_int of the advertised size.
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&raw const one).cast(),
            socklen_of::<libc::c_int>(),
        );
    }
    let (storage, len) = sockaddr_from(addr);
    // SAFETY: storage holds a valid sockaddr of len bytes.
    if unsafe { libc::bind(fd, (&raw const storage).cast(), len) } < 0 {
        let err = io::Error::last_os_error();
        // SAFETY: fd was created above.
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(fd)
}

/// Converts a resolved address into a raw sockaddr.
#[allow(clippy::cast_possible_truncation)]
fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: sockaddr_storage is valid when zeroed.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            // SAFETY: storage is zeroed and large enough for sockaddr_in.
            let sin = unsafe { &mut *(&raw mut storage).cast::<libc::sockaddr_in>() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            // octets() is already network byte order.
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            socklen_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            // SAFETY: storage is zeroed and large enough for sockaddr_in6.
            let sin6 = unsafe { &mut *(&raw mut storage).cast::<libc::sockaddr_in6>() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_scope_id = v6.scope_id();
            socklen_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len)
}

/// Accepts one client on a bound descriptor, dispatching on the socket
/// type so one wire operation covers both TCP and UDP listeners.
///
/// # Errors
///
/// Any OS error from the underlying accept, peek, connect, or rebind.
pub fn accept(fd: RawFd) -> io::Result<Accepted> {
    if socket_type(fd)? == libc::SOCK_DGRAM {
        accept_udp(fd)
    } else {
        accept_tcp(fd)
    }
}

/// Queries `SO_TYPE` for a descriptor.
fn socket_type(fd: RawFd) -> io::Result<libc::c_int> {
    let mut ty: libc::c_int = 0;
    let mut len = socklen_of::<libc::c_int>();
    // SAFETY: ty and len are valid out-pointers of the advertised sizes.
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            (&raw mut ty).cast(),
            &raw mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ty)
}

fn accept_tcp(fd: RawFd) -> io::Result<Accepted> {
    // SAFETY: sockaddr_storage is valid when zeroed.
    let mut peer: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut peer_len = socklen_of::<libc::sockaddr_storage>();
    // SAFETY: peer and peer_len describe a writable sockaddr_storage.
    let client = unsafe { libc::accept(fd, (&raw mut peer).cast(), &raw mut peer_len) };
    if client < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Accepted {
        bind_fd: fd,
        client_fd: client,
        peer_addr: addr_bytes(&peer),
    })
}

fn accept_udp(fd: RawFd) -> io::Result<Accepted> {
    // Peer of the next queued datagram, peeked so the payload stays
    // readable on the client descriptor.
    // SAFETY: sockaddr_storage is valid when zeroed.
    let mut peer: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut peer_len = socklen_of::<libc::sockaddr_storage>();
    let mut probe = [0u8; 1];
    // SAFETY: probe, peer, and peer_len are valid for the advertised sizes.
    let n = unsafe {
        libc::recvfrom(
            fd,
            probe.as_mut_ptr().cast(),
            probe.len(),
            libc::MSG_PEEK,
            (&raw mut peer).cast(),
            &raw mut peer_len,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    // Local address, captured before the connect narrows the socket.
    // SAFETY: sockaddr_storage is valid when zeroed.
    let mut local: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut local_len = socklen_of::<libc::sockaddr_storage>();
    // SAFETY: local and local_len describe a writable sockaddr_storage.
    if unsafe { libc::getsockname(fd, (&raw mut local).cast(), &raw mut local_len) } < 0 {
        return Err(io::Error::last_os_error());
    }

    // The bound socket becomes the client socket.
    // SAFETY: peer was filled by recvfrom with peer_len bytes.
    if unsafe { libc::connect(fd, (&raw const peer).cast(), peer_len) } < 0 {
        return Err(io::Error::last_os_error());
    }

    // A fresh socket on the same local address keeps accepting new
    // clients; it is the "new bind fd" the target expects back.
    // SAFETY: plain socket(2) call.
    let fresh = unsafe { libc::socket(libc::c_int::from(local.ss_family), libc::SOCK_DGRAM, 0) };
    if fresh < 0 {
        return Err(io::Error::last_os_error());
    }
    let one: libc::c_int = 1;
    // SAFETY: one is a valid c_int of the advertised size.
    unsafe {
        libc::setsockopt(
            fresh,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&raw const one).cast(),
            socklen_of::<libc::c_int>(),
        );
    }
    // SAFETY: local was filled by getsockname with local_len bytes.
    if unsafe { libc::bind(fresh, (&raw const local).cast(), local_len) } < 0 {
        let err = io::Error::last_os_error();
        // SAFETY: fresh is a descriptor this function just created.
        unsafe { libc::close(fresh) };
        return Err(err);
    }

    Ok(Accepted {
        bind_fd: fresh,
        client_fd: fd,
        peer_addr: addr_bytes(&peer),
    })
}

/// Extracts the raw address octets from a peer sockaddr.
fn addr_bytes(storage: &libc::sockaddr_storage) -> Vec<u8> {
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            // SAFETY: ss_family identifies the storage as sockaddr_in.
            let sin = unsafe { &*std::ptr::from_ref(storage).cast::<libc::sockaddr_in>() };
            // s_addr is already in network byte order.
            sin.sin_addr.s_addr.to_ne_bytes().to_vec()
        }
        libc::AF_INET6 => {
            // SAFETY: ss_family identifies the storage as sockaddr_in6.
            let sin6 = unsafe { &*std::ptr::from_ref(storage).cast::<libc::sockaddr_in6>() };
            sin6.sin6_addr.s6_addr.to_vec()
        }
        _ => Vec::new(),
    }
}

/// Receives up to `len` bytes, blocking until something arrives (or the
/// peer closes, which yields an empty buffer).
///
/// # Errors
///
/// Any OS read error other than `EINTR`, which is retried.
pub fn recv(fd: RawFd, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    loop {
        // SAFETY: buf is writable for len bytes.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            #[allow(clippy::cast_sign_loss)]
            buf.truncate(n as usize);
            return Ok(buf);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Receives up to `len` bytes, waiting at most `timeout_ms` for data.
///
/// # Errors
///
/// `TimedOut` when nothing arrives in time; otherwise as [`recv`].
pub fn recv_timeout(fd: RawFd, len: usize, timeout_ms: u32) -> io::Result<Vec<u8>> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout = libc::c_int::try_from(timeout_ms).unwrap_or(libc::c_int::MAX);
    loop {
        // SAFETY: pfd is a valid pollfd struct.
        let ret = unsafe { libc::poll(&raw mut pfd, 1, timeout) };
        if ret == 0 {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "recv timed out"));
        }
        if ret > 0 {
            return recv(fd, len);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Sends `data`, returning the number of bytes actually transmitted
/// (which may be short, as the target's runtime expects).
///
/// # Errors
///
/// Any OS write error other than `EINTR`, which is retried.
pub fn send(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    loop {
        // SAFETY: data is readable for data.len() bytes.
        let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
        if n >= 0 {
            #[allow(clippy::cast_sign_loss)]
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Toggles blocking mode on a descriptor.
///
/// # Errors
///
/// Any `fcntl` failure.
pub fn set_blocking(fd: RawFd, blocking: bool) -> io::Result<()> {
    // SAFETY: F_GETFL takes no argument.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if blocking {
        flags & !libc::O_NONBLOCK
    } else {
        flags | libc::O_NONBLOCK
    };
    // SAFETY: F_SETFL with a flags argument.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Releases a socket: orderly shutdown, then close. Errors are ignored,
/// matching the void release the target's runtime calls.
pub fn close(fd: RawFd) {
    // SAFETY: shutdown and close on a descriptor the target handed back.
    unsafe {
        libc::shutdown(fd, libc::SHUT_RDWR);
        libc::close(fd);
    }
}

/// `socklen_t` for a given out-parameter type.
#[allow(clippy::cast_possible_truncation)]
fn socklen_of<T>() -> libc::socklen_t {
    mem::size_of::<T>() as libc::socklen_t
}
