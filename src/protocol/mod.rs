/// SOCKS5 packet builders and reply parsing
pub mod wire;

pub use wire::*;
