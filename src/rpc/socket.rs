//! UDP socket layer formatting and parsing K-RPC messages.

use std::io::ErrorKind;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use tracing::trace;

use crate::common::Message;

use super::config::Config;

const VERSION: [u8; 4] = [77, 78, 0, 1]; // "MN" version 01
const MTU: usize = 2048;

pub const DEFAULT_PORT: u16 = 6881;

/// A UdpSocket wrapper that formats and parses DHT messages.
///
/// Both methods take `&self`, so one socket is shared by the receive loop
/// and every thread sending requests.
#[derive(Debug)]
pub struct KrpcSocket {
    socket: UdpSocket,
    local_addr: SocketAddrV4,
}

impl KrpcSocket {
    pub(crate) fn new(config: &Config) -> Result<Self, std::io::Error> {
        let socket = if let Some(address) = config.address {
            UdpSocket::bind(address)?
        } else {
            match UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))) {
                Ok(socket) => Ok(socket),
                Err(_) => UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], 0))),
            }?
        };

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => {
                return Err(std::io::Error::new(
                    ErrorKind::Unsupported,
                    "KrpcSocket does not support Ipv6",
                ))
            }
        };

        // Zero would mean blocking forever, and the receive loop could never stop.
        socket.set_read_timeout(Some(config.poll_interval.max(Duration::from_millis(1))))?;

        Ok(Self { socket, local_addr })
    }

    // === Getters ===

    /// Returns the address the server is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    // === Public Methods ===

    /// Send a message with our version attached.
    pub fn send(&self, address: SocketAddrV4, mut message: Message) -> Result<(), SendMessageError> {
        message.version = Some(VERSION.to_vec());

        self.socket.send_to(&message.to_bytes()?, address)?;
        trace!(context = "socket_message_sending", ?address, ?message);

        Ok(())
    }

    /// Receives a single krpc message on the socket.
    /// On success, returns the dht message and the origin.
    ///
    /// Returns `None` on timeout, and for every packet that is not a valid message.
    pub fn recv_from(&self) -> Option<(Message, SocketAddrV4)> {
        let mut buf = [0u8; MTU];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => {
                let bytes = &buf[..amt];

                if from.port() == 0 {
                    trace!(
                        context = "socket_validation",
                        message = "Message from port 0"
                    );
                    return None;
                }

                match Message::from_bytes(bytes) {
                    Ok(message) => {
                        trace!(
                            context = "socket_message_receiving",
                            ?message,
                            ?from,
                            "Received message"
                        );
                        return Some((message, from));
                    }
                    Err(error) => {
                        trace!(
                            context = "socket_error",
                            ?error,
                            ?from,
                            message = ?String::from_utf8_lossy(bytes),
                            "Received invalid Bencode message."
                        );
                    }
                }
            }
            Ok((_, SocketAddr::V6(_))) => {
                trace!(
                    context = "socket_validation",
                    message = "Received IPv6 packet"
                );
            }
            Err(ref e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => {
                trace!(
                    context = "socket_error",
                    ?e,
                    "recv_from failed unexpectedly"
                );
            }
        }

        None
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors sending a message.
pub enum SendMessageError {
    /// Errors related to encoding DHT messages.
    #[error("Failed to encode packet bytes: {0}")]
    EncodeError(#[from] crate::Error),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}
