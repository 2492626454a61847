//! SOCKS5 wire format (RFC 1928) with username/password subnegotiation
//! (RFC 1929).
//!
//! Only the client side of the exchange is produced here: the greeting, the
//! auth request, and the command request. Requests always carry the IPv4
//! address type; replies are parsed for version, status, and (for BIND) the
//! bound port.

use crate::util::{Result, TunnelError};
use std::net::Ipv4Addr;

/// SOCKS5 version
pub const SOCKS5_VERSION: u8 = 0x05;

/// Username/password subnegotiation version (RFC 1929)
pub const AUTH_VERSION: u8 = 0x01;

/// SOCKS5 authentication methods
#[allow(dead_code)]
pub const AUTH_NO_AUTHENTICATION: u8 = 0x00;
#[allow(dead_code)]
pub const AUTH_GSSAPI: u8 = 0x01;
pub const AUTH_PASSWORD: u8 = 0x02;

/// RFC 1929 auth status
pub const AUTH_SUCCEEDED: u8 = 0x00;

/// SOCKS5 address types
pub const ATYP_IPV4: u8 = 0x01;

/// SOCKS5 reply codes
pub const REPLY_SUCCEEDED: u8 = 0x00;

/// Length of the method-selection and auth replies.
pub const SHORT_REPLY_LEN: usize = 2;
/// Length of a command reply carrying an IPv4 bound address.
pub const COMMAND_REPLY_LEN: usize = 10;
/// Offset of the bound port inside a command reply.
pub const BOUND_PORT_OFFSET: usize = 8;

/// SOCKS5 command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCmd {
    Connect,
    Bind,
}

impl SocksCmd {
    pub fn code(self) -> u8 {
        match self {
            SocksCmd::Connect => 0x01,
            SocksCmd::Bind => 0x02,
        }
    }
}

impl std::fmt::Display for SocksCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocksCmd::Connect => write!(f, "connect"),
            SocksCmd::Bind => write!(f, "bind"),
        }
    }
}

/// Client greeting: `[VER | NMETHODS | METHODS]`, advertising only
/// username/password authentication.
pub fn greeting() -> [u8; 3] {
    [SOCKS5_VERSION, 0x01, AUTH_PASSWORD]
}

/// Auth request: `[VER | ULEN | UNAME | PLEN | PASSWD]`.
///
/// Username and password are limited to 255 bytes each by the length octets.
pub fn auth_request(username: &str, password: &str) -> Result<Vec<u8>> {
    let user = username.as_bytes();
    let pass = password.as_bytes();
    if user.len() > 255 {
        return Err(TunnelError::Protocol("Username too long".to_string()));
    }
    if pass.len() > 255 {
        return Err(TunnelError::Protocol("Password too long".to_string()));
    }

    let mut packet = Vec::with_capacity(3 + user.len() + pass.len());
    packet.push(AUTH_VERSION);
    packet.push(user.len() as u8);
    packet.extend_from_slice(user);
    packet.push(pass.len() as u8);
    packet.extend_from_slice(pass);
    Ok(packet)
}

/// Command request: `[VER | CMD | RSV | ATYP | DST.ADDR (4) | DST.PORT (2)]`,
/// IPv4 address type only, port in network order.
pub fn command_request(command: SocksCmd, addr: Ipv4Addr, port: u16) -> [u8; 10] {
    let ip = addr.octets();
    let port = port.to_be_bytes();
    [
        SOCKS5_VERSION,
        command.code(),
        0x00,
        ATYP_IPV4,
        ip[0],
        ip[1],
        ip[2],
        ip[3],
        port[0],
        port[1],
    ]
}

/// Did the server pick username/password auth in its method selection?
pub fn method_accepted(reply: &[u8]) -> bool {
    reply.len() >= SHORT_REPLY_LEN && reply[0] == SOCKS5_VERSION && reply[1] == AUTH_PASSWORD
}

/// Did the server accept the submitted credentials?
pub fn auth_accepted(reply: &[u8]) -> bool {
    reply.len() >= SHORT_REPLY_LEN && reply[0] == AUTH_VERSION && reply[1] == AUTH_SUCCEEDED
}

/// Was the command request granted? Only version and status are inspected.
pub fn reply_succeeded(reply: &[u8]) -> bool {
    reply.len() >= SHORT_REPLY_LEN && reply[0] == SOCKS5_VERSION && reply[1] == REPLY_SUCCEEDED
}

/// Extract the bound port from a command reply (big-endian at offset 8).
/// Returns `None` when the reply is too short to carry it.
pub fn bound_port(reply: &[u8]) -> Option<u16> {
    let bytes = reply.get(BOUND_PORT_OFFSET..BOUND_PORT_OFFSET + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}
