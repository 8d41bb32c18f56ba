//! Socket addresses.
//!
//! [`Address`] wraps the libc sockaddr family behind one enum with a raw
//! `sockaddr` accessor, so the socket layer can hand any variant straight to
//! the kernel. [`Address::lookup`] understands `host`, `host:port`,
//! `[v6]:port` and service names, resolving names through `getaddrinfo`.

use std::ffi::CString;
use std::fmt;
use std::mem::{self, MaybeUninit};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::Path;
use std::os::unix::ffi::OsStrExt;

use crate::error::Error;

/// One socket address: IPv4, IPv6, Unix-domain, or an unparsed blob of some
/// other family.
#[derive(Clone, Copy)]
pub enum Address {
    V4(libc::sockaddr_in),
    V6(libc::sockaddr_in6),
    Unix(libc::sockaddr_un),
    Unknown(libc::sockaddr_storage),
}

impl Address {
    pub fn ipv4(ip: Ipv4Addr, port: u16) -> Address {
        // SAFETY: all-zero is a valid sockaddr_in.
        let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        sa.sin_family = libc::AF_INET as libc::sa_family_t;
        sa.sin_port = port.to_be();
        sa.sin_addr = libc::in_addr {
            s_addr: u32::from(ip).to_be(),
        };
        Address::V4(sa)
    }

    pub fn ipv6(ip: Ipv6Addr, port: u16) -> Address {
        // SAFETY: all-zero is a valid sockaddr_in6.
        let mut sa: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        sa.sin6_port = port.to_be();
        sa.sin6_addr.s6_addr = ip.octets();
        Address::V6(sa)
    }

    /// `0.0.0.0:port`, the usual listen address.
    pub fn any_ipv4(port: u16) -> Address {
        Address::ipv4(Ipv4Addr::UNSPECIFIED, port)
    }

    /// A Unix-domain path address. Fails on paths longer than `sun_path`.
    pub fn unix<P: AsRef<Path>>(path: P) -> crate::Result<Address> {
        let bytes = path.as_ref().as_os_str().as_bytes();
        // SAFETY: all-zero is a valid sockaddr_un.
        let mut sa: libc::sockaddr_un = unsafe { mem::zeroed() };
        if bytes.len() >= sa.sun_path.len() {
            return Err(Error::InvalidAddress(format!(
                "unix path too long: {:?}",
                path.as_ref()
            )));
        }
        sa.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (dst, src) in sa.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }
        Ok(Address::Unix(sa))
    }

    pub fn from_std(addr: SocketAddr) -> Address {
        match addr {
            SocketAddr::V4(v4) => Address::ipv4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => Address::ipv6(*v6.ip(), v6.port()),
        }
    }

    /// Reinterprets a kernel-filled `sockaddr_storage`.
    pub fn from_storage(storage: &libc::sockaddr_storage, _len: libc::socklen_t) -> Address {
        match storage.ss_family as libc::c_int {
            // SAFETY: the kernel fills the structure matching the family it
            // reports; the target structs fit inside sockaddr_storage.
            libc::AF_INET => Address::V4(unsafe {
                *(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in)
            }),
            libc::AF_INET6 => Address::V6(unsafe {
                *(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
            }),
            libc::AF_UNIX => Address::Unix(unsafe {
                *(storage as *const libc::sockaddr_storage as *const libc::sockaddr_un)
            }),
            _ => Address::Unknown(*storage),
        }
    }

    pub fn family(&self) -> libc::c_int {
        match self {
            Address::V4(_) => libc::AF_INET,
            Address::V6(_) => libc::AF_INET6,
            Address::Unix(_) => libc::AF_UNIX,
            Address::Unknown(sa) => sa.ss_family as libc::c_int,
        }
    }

    /// The raw pointer/length pair for libc calls. The pointer borrows from
    /// `self` and is valid as long as the address is.
    pub fn as_sockaddr(&self) -> (*const libc::sockaddr, libc::socklen_t) {
        match self {
            Address::V4(sa) => (
                sa as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ),
            Address::V6(sa) => (
                sa as *const libc::sockaddr_in6 as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            ),
            Address::Unix(sa) => (
                sa as *const libc::sockaddr_un as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            ),
            Address::Unknown(sa) => (
                sa as *const libc::sockaddr_storage as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
            ),
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Address::V4(sa) => Some(u16::from_be(sa.sin_port)),
            Address::V6(sa) => Some(u16::from_be(sa.sin6_port)),
            _ => None,
        }
    }

    pub fn set_port(&mut self, port: u16) {
        match self {
            Address::V4(sa) => sa.sin_port = port.to_be(),
            Address::V6(sa) => sa.sin6_port = port.to_be(),
            _ => {}
        }
    }

    /// The std counterpart for the ip variants.
    pub fn to_std(&self) -> Option<SocketAddr> {
        match self {
            Address::V4(sa) => Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
                u16::from_be(sa.sin_port),
            ))),
            Address::V6(sa) => Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sa.sin6_addr.s6_addr),
                u16::from_be(sa.sin6_port),
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            ))),
            _ => None,
        }
    }

    /// Resolves `host`, `host:port`, `[v6]:port` or `host:service` into the
    /// matching addresses, v4 first. Numeric forms skip the resolver.
    pub fn lookup(spec: &str) -> crate::Result<Vec<Address>> {
        let (host, service) = split_host_service(spec)?;

        // Numeric fast paths.
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(vec![Address::ipv4(ip, numeric_port(service)?)]);
        }
        if let Ok(ip) = host.parse::<Ipv6Addr>() {
            return Ok(vec![Address::ipv6(ip, numeric_port(service)?)]);
        }

        let c_host = CString::new(host)
            .map_err(|_| Error::InvalidAddress(format!("nul byte in host: {:?}", spec)))?;
        let c_service = match service {
            Some(s) => Some(
                CString::new(s)
                    .map_err(|_| Error::InvalidAddress(format!("nul byte in service: {:?}", spec)))?,
            ),
            None => None,
        };

        // SAFETY: zeroed hints with only the fields getaddrinfo reads set.
        let mut hints: libc::addrinfo = unsafe { MaybeUninit::zeroed().assume_init() };
        hints.ai_family = libc::AF_UNSPEC;
        hints.ai_socktype = libc::SOCK_STREAM;

        let mut result: *mut libc::addrinfo = std::ptr::null_mut();
        // SAFETY: valid hint and out pointers; result is freed below.
        let rc = unsafe {
            libc::getaddrinfo(
                c_host.as_ptr(),
                c_service.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
                &hints,
                &mut result,
            )
        };
        if rc != 0 {
            return Err(Error::InvalidAddress(format!(
                "failed to resolve {:?}",
                spec
            )));
        }

        let mut addrs = Vec::with_capacity(4);
        let mut current = result;
        while !current.is_null() {
            // SAFETY: walking the list getaddrinfo allocated.
            let ai = unsafe { &*current };
            if !ai.ai_addr.is_null() {
                // SAFETY: ai_addr points at a sockaddr of ai_addrlen bytes.
                let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        ai.ai_addr as *const u8,
                        &mut storage as *mut libc::sockaddr_storage as *mut u8,
                        (ai.ai_addrlen as usize).min(mem::size_of::<libc::sockaddr_storage>()),
                    );
                }
                addrs.push(Address::from_storage(&storage, ai.ai_addrlen));
            }
            current = ai.ai_next;
        }
        // SAFETY: the list head returned by getaddrinfo.
        unsafe { libc::freeaddrinfo(result) };

        // Prefer v4, like the resolver-order-insensitive callers expect.
        addrs.sort_by_key(|a| match a {
            Address::V4(_) => 0,
            Address::V6(_) => 1,
            _ => 2,
        });
        if addrs.is_empty() {
            return Err(Error::InvalidAddress(format!("no addresses for {:?}", spec)));
        }
        Ok(addrs)
    }

    /// First match of [`lookup`](Self::lookup).
    pub fn lookup_any(spec: &str) -> crate::Result<Address> {
        Ok(Self::lookup(spec)?.remove(0))
    }
}

fn numeric_port(service: Option<&str>) -> crate::Result<u16> {
    match service {
        None => Ok(0),
        Some(s) => s
            .parse::<u16>()
            .map_err(|_| Error::InvalidAddress(format!("invalid port: {:?}", s))),
    }
}

/// Splits `host[:service]`, understanding `[v6]:service` and bare v6
/// literals (more than one colon without brackets).
fn split_host_service(spec: &str) -> crate::Result<(&str, Option<&str>)> {
    if spec.is_empty() {
        return Err(Error::InvalidAddress("empty address".into()));
    }
    if let Some(rest) = spec.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| Error::InvalidAddress(format!("unclosed '[' in {:?}", spec)))?;
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Ok((host, None));
        }
        let service = tail
            .strip_prefix(':')
            .ok_or_else(|| Error::InvalidAddress(format!("garbage after ']' in {:?}", spec)))?;
        return Ok((host, Some(service)));
    }
    match (spec.find(':'), spec.rfind(':')) {
        (Some(first), Some(last)) if first == last => {
            Ok((&spec[..first], Some(&spec[first + 1..])))
        }
        // More than one colon: a bare v6 literal.
        (Some(_), _) => Ok((spec, None)),
        (None, _) => Ok((spec, None)),
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::V4(_) | Address::V6(_) => {
                write!(f, "{}", self.to_std().expect("ip address"))
            }
            Address::Unix(sa) => {
                let len = sa
                    .sun_path
                    .iter()
                    .position(|&c| c == 0)
                    .unwrap_or(sa.sun_path.len());
                let bytes: Vec<u8> = sa.sun_path[..len].iter().map(|&c| c as u8).collect();
                write!(f, "unix:{}", String::from_utf8_lossy(&bytes))
            }
            Address::Unknown(sa) => write!(f, "unknown(family={})", sa.ss_family),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_v4_with_port() {
        let addr = Address::lookup_any("127.0.0.1:8080").unwrap();
        assert_eq!(addr.to_std().unwrap().to_string(), "127.0.0.1:8080");
        assert_eq!(addr.port(), Some(8080));
    }

    #[test]
    fn parses_v6_bracketed() {
        let addr = Address::lookup_any("[::1]:8080").unwrap();
        assert_eq!(addr.to_std().unwrap().to_string(), "[::1]:8080");
        assert_eq!(addr.family(), libc::AF_INET6);
    }

    #[test]
    fn parses_bare_v6_literal() {
        let addr = Address::lookup_any("::1").unwrap();
        assert_eq!(addr.family(), libc::AF_INET6);
        assert_eq!(addr.port(), Some(0));
    }

    #[test]
    fn rejects_bad_port() {
        assert!(Address::lookup("127.0.0.1:notaport").is_err());
        assert!(Address::lookup("[::1").is_err());
        assert!(Address::lookup("").is_err());
    }

    #[test]
    fn set_port_roundtrip() {
        let mut addr = Address::any_ipv4(0);
        addr.set_port(1234);
        assert_eq!(addr.port(), Some(1234));
        assert_eq!(addr.to_string(), "0.0.0.0:1234");
    }

    #[test]
    fn storage_roundtrip() {
        let addr = Address::ipv4(Ipv4Addr::new(10, 1, 2, 3), 99);
        let (sockaddr, len) = addr.as_sockaddr();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        unsafe {
            std::ptr::copy_nonoverlapping(
                sockaddr as *const u8,
                &mut storage as *mut libc::sockaddr_storage as *mut u8,
                len as usize,
            );
        }
        let back = Address::from_storage(&storage, len);
        assert_eq!(back.to_string(), "10.1.2.3:99");
    }

    #[test]
    fn unix_path_display() {
        let addr = Address::unix("/tmp/test.sock").unwrap();
        assert_eq!(addr.family(), libc::AF_UNIX);
        assert_eq!(addr.to_string(), "unix:/tmp/test.sock");
    }
}
