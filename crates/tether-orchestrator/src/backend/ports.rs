//! Ephemeral port selection

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

/// Attempts before giving up on finding a free pair
const MAX_ATTEMPTS: usize = 16;

/// Pick two distinct free TCP ports on the loopback interface
///
/// The probe listeners are dropped before returning, so another process can
/// still grab a port before the backend binds it. The backend's own bind
/// failure surfaces through the health check.
pub fn pick_port_pair() -> io::Result<(u16, u16)> {
    for _ in 0..MAX_ATTEMPTS {
        let first = pick_port()?;
        let second = pick_port()?;
        if first != second {
            return Ok((first, second));
        }
        tracing::debug!("Port collision on {}, retrying", first);
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "could not find two distinct free ports",
    ))
}

/// Pick one free TCP port by letting the OS assign it
#[cfg(not(windows))]
pub fn pick_port() -> io::Result<u16> {
    let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Pick one free TCP port by sampling the dynamic range
///
/// Port 0 assignments on Windows come from a range that the backend's
/// proxy rejects, so candidates are drawn from the IANA dynamic range and
/// checked with a bind probe.
#[cfg(windows)]
pub fn pick_port() -> io::Result<u16> {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    for _ in 0..MAX_ATTEMPTS * 4 {
        let candidate: u16 = rng.gen_range(49152..=65535);
        if TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, candidate)).is_ok() {
            return Ok(candidate);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "no free port in the dynamic range",
    ))
}
