//! Conversions between `SocketAddress` and the raw sockaddr forms
//!
//! Keeps all libc address plumbing in one place; `netmux-core` stays
//! platform-agnostic.

use std::mem;
use std::os::unix::io::RawFd;

use netmux_core::{AddressFamily, MuxError, MuxResult, SocketAddress};

/// Last OS error as a raw errno value
#[inline]
pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

/// Put a descriptor into non-blocking mode
pub(crate) fn set_nonblocking(fd: RawFd) -> MuxResult<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(MuxError::Platform(errno()));
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(MuxError::Platform(errno()));
    }
    Ok(())
}

/// Set close-on-exec on a descriptor
pub(crate) fn set_cloexec(fd: RawFd) -> MuxResult<()> {
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
    if ret < 0 {
        return Err(MuxError::Platform(errno()));
    }
    Ok(())
}

/// Encode an address for bind/connect/sendto
///
/// The unspecified placeholder has no wire form and is rejected.
pub(crate) fn to_storage(
    addr: &SocketAddress,
) -> MuxResult<(libc::sockaddr_storage, libc::socklen_t)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr.family() {
        AddressFamily::Unspecified => Err(MuxError::AddressParse),
        AddressFamily::Ipv4 => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            let raw = addr.raw_bytes();
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = addr.port().to_be();
                (*sin).sin_addr.s_addr =
                    u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]).to_be();
            }
            Ok((storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t))
        }
        AddressFamily::Ipv6 => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = addr.port().to_be();
                (*sin6).sin6_addr.s6_addr = *addr.raw_bytes();
            }
            Ok((storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t))
        }
    }
}

/// Decode the sockaddr filled in by accept/getsockname/recvfrom
pub(crate) fn from_storage(
    storage: &libc::sockaddr_storage,
    len: libc::socklen_t,
) -> MuxResult<SocketAddress> {
    match storage.ss_family as i32 {
        libc::AF_INET => {
            if (len as usize) < mem::size_of::<libc::sockaddr_in>() {
                return Err(MuxError::AddressParse);
            }
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let mut raw = [0u8; 16];
            raw[..4].copy_from_slice(&u32::from_be(sin.sin_addr.s_addr).to_be_bytes());
            Ok(SocketAddress::from_parts(
                AddressFamily::Ipv4,
                raw,
                u16::from_be(sin.sin_port),
            ))
        }
        libc::AF_INET6 => {
            if (len as usize) < mem::size_of::<libc::sockaddr_in6>() {
                return Err(MuxError::AddressParse);
            }
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddress::from_parts(
                AddressFamily::Ipv6,
                sin6.sin6_addr.s6_addr,
                u16::from_be(sin6.sin6_port),
            ))
        }
        _ => Err(MuxError::AddressParse),
    }
}

/// Read the local address bound to a descriptor
pub(crate) fn local_address(fd: RawFd) -> MuxResult<SocketAddress> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if ret != 0 {
        return Err(MuxError::Platform(errno()));
    }
    from_storage(&storage, len)
}
