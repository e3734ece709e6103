//! Socket collaborators used by the session state machines.
//!
//! Each step of socket setup is its own call so a state handler can fail on
//! exactly one of them: create, set options, bind, listen, connect, accept.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use thiserror::Error;

/// Listen backlog for the receiver.
pub const DEFAULT_BACKLOG: i32 = libc::SOMAXCONN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Address family not supported: {0:?}")]
    Unsupported(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("The port is required.")]
    Missing,
    #[error("Invalid characters in input.")]
    InvalidCharacters,
    #[error("in_port_t value out of range.")]
    OutOfRange,
}

/// Convert a textual IPv4 or IPv6 literal; IPv4 is tried first.
pub fn resolve_address(text: &str) -> Result<IpAddr, AddressError> {
    if let Ok(v4) = text.parse::<Ipv4Addr>() {
        return Ok(IpAddr::V4(v4));
    }
    if let Ok(v6) = text.parse::<Ipv6Addr>() {
        return Ok(IpAddr::V6(v6));
    }
    Err(AddressError::Unsupported(text.to_string()))
}

/// Decimal port number in `0..=65535`.
pub fn parse_port(text: &str) -> Result<u16, PortError> {
    if text.is_empty() {
        return Err(PortError::Missing);
    }
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PortError::InvalidCharacters);
    }
    // digits only, so the only failure left is overflow
    text.parse::<u16>().map_err(|_| PortError::OutOfRange)
}

pub fn create_socket(addr: &SocketAddr) -> io::Result<Socket> {
    Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))
}

pub fn enable_address_reuse(socket: &Socket) -> io::Result<()> {
    socket.set_reuse_address(true)
}

pub fn bind_socket(socket: &Socket, addr: &SocketAddr) -> io::Result<()> {
    socket.bind(&SockAddr::from(*addr))
}

/// Start listening and hand the socket over as a std listener.
pub fn start_listening(socket: Socket, backlog: i32) -> io::Result<TcpListener> {
    socket.listen(backlog)?;
    Ok(socket.into())
}

pub fn connect_socket(socket: Socket, addr: &SocketAddr) -> io::Result<TcpStream> {
    socket.connect(&SockAddr::from(*addr))?;
    let stream: TcpStream = socket.into();
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Accept one connection, retrying if a signal interrupts the call.
pub fn accept_client(listener: &TcpListener) -> io::Result<(TcpStream, SocketAddr)> {
    loop {
        match listener.accept() {
            Ok(pair) => return Ok(pair),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Shut both directions down; a peer that already went away is not an error.
pub fn close_stream(stream: &TcpStream) -> io::Result<()> {
    match stream.shutdown(Shutdown::Both) {
        Err(e) if e.kind() != ErrorKind::NotConnected => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_address_families() {
        assert_eq!(
            resolve_address("127.0.0.1"),
            Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert_eq!(resolve_address("::1"), Ok(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(matches!(
            resolve_address("localhost"),
            Err(AddressError::Unsupported(_))
        ));
        assert!(resolve_address("256.1.1.1").is_err());
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("9000"), Ok(9000));
        assert_eq!(parse_port("0"), Ok(0));
        assert_eq!(parse_port("65535"), Ok(65535));
        assert_eq!(parse_port("65536"), Err(PortError::OutOfRange));
        assert_eq!(parse_port("99999999999999999999"), Err(PortError::OutOfRange));
        assert_eq!(parse_port("80a"), Err(PortError::InvalidCharacters));
        assert_eq!(parse_port("-1"), Err(PortError::InvalidCharacters));
        assert_eq!(parse_port(""), Err(PortError::Missing));
    }

    #[test]
    fn test_listen_connect_accept() {
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = create_socket(&bind).unwrap();
        enable_address_reuse(&socket).unwrap();
        bind_socket(&socket, &bind).unwrap();
        let listener = start_listening(socket, DEFAULT_BACKLOG).unwrap();
        let local = listener.local_addr().unwrap();

        let client = connect_socket(create_socket(&local).unwrap(), &local).unwrap();
        let (server, peer) = accept_client(&listener).unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
        close_stream(&client).unwrap();
        close_stream(&server).unwrap();
    }
}
