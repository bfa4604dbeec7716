//! Serialize and deserialize K-RPC messages.

mod internal;

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, SocketAddrV4};

use serde_bencode::value::Value;

use crate::common::{Id, Node, ID_SIZE};
use crate::{Error, Result};

/// Size of a compact peer info: 4 bytes IPv4 followed by a 2 bytes big-endian port.
pub const COMPACT_PEER_SIZE: usize = 6;
/// Size of a compact node info: node id followed by a compact peer info.
pub const COMPACT_NODE_SIZE: usize = ID_SIZE + COMPACT_PEER_SIZE;

pub const ERROR_GENERIC: i64 = 201;
pub const ERROR_SERVER: i64 = 202;
pub const ERROR_PROTOCOL: i64 = 203;
pub const ERROR_METHOD_UNKNOWN: i64 = 204;

#[derive(Debug, PartialEq, Clone)]
pub struct Message {
    /// Opaque bytes echoed back in responses. Our own requests use 2 bytes.
    pub transaction_id: Vec<u8>,

    /// The version of the requester or responder.
    pub version: Option<Vec<u8>>,

    pub message_type: MessageType,
}

#[derive(Debug, PartialEq, Clone)]
pub enum MessageType {
    Request(RequestSpecific),

    /// The `r` dictionary of a response.
    Response(Arguments),

    Error(ErrorSpecific),
}

#[derive(Debug, PartialEq, Clone)]
pub struct RequestSpecific {
    pub method: String,
    pub arguments: Arguments,
}

#[derive(Debug, PartialEq, Clone)]
pub struct ErrorSpecific {
    pub code: i64,
    pub description: String,
}

/// A bencode dictionary used for query arguments and response results.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Arguments(BTreeMap<Vec<u8>, Value>);

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<K: Into<Vec<u8>>>(&mut self, key: K, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn insert_bytes<K: Into<Vec<u8>>, V: Into<Vec<u8>>>(&mut self, key: K, value: V) {
        self.0.insert(key.into(), Value::Bytes(value.into()));
    }

    pub fn insert_int<K: Into<Vec<u8>>>(&mut self, key: K, value: i64) {
        self.0.insert(key.into(), Value::Int(value));
    }

    /// Builder flavour of [Self::insert_bytes].
    pub fn with_bytes<K: Into<Vec<u8>>, V: Into<Vec<u8>>>(mut self, key: K, value: V) -> Self {
        self.insert_bytes(key, value);
        self
    }

    /// Builder flavour of [Self::insert_int].
    pub fn with_int<K: Into<Vec<u8>>>(mut self, key: K, value: i64) -> Self {
        self.insert_int(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key.as_bytes())
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.get(key) {
            Some(Value::Bytes(bytes)) => Some(bytes),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(Value::Int(int)) => Some(*int),
            _ => None,
        }
    }

    /// Returns the value at `key` if it is exactly a 20 bytes string.
    pub fn get_id(&self, key: &str) -> Option<Id> {
        self.get_bytes(key).and_then(|bytes| Id::from_bytes(bytes).ok())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Value)> {
        self.0.iter()
    }
}

impl From<Arguments> for Value {
    fn from(arguments: Arguments) -> Self {
        Value::Dict(arguments.0.into_iter().collect::<HashMap<_, _>>())
    }
}

impl TryFrom<Value> for Arguments {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Dict(dict) => Ok(Arguments(dict.into_iter().collect())),
            _ => Err(Error::InvalidMessage("expected a dictionary")),
        }
    }
}

impl Message {
    fn into_serde_message(self) -> internal::DHTMessage {
        let mut serde_message = internal::DHTMessage {
            transaction_id: self.transaction_id,
            message_type: String::new(),
            method: None,
            arguments: None,
            response: None,
            error: None,
            version: self.version,
        };

        match self.message_type {
            MessageType::Request(RequestSpecific { method, arguments }) => {
                serde_message.message_type = "q".to_string();
                serde_message.method = Some(method);
                serde_message.arguments = Some(arguments.into());
            }
            MessageType::Response(result) => {
                serde_message.message_type = "r".to_string();
                serde_message.response = Some(result.into());
            }
            MessageType::Error(ErrorSpecific { code, description }) => {
                serde_message.message_type = "e".to_string();
                serde_message.error = Some(vec![
                    Value::Int(code),
                    Value::Bytes(description.into_bytes()),
                ]);
            }
        }

        serde_message
    }

    fn from_serde_message(msg: internal::DHTMessage) -> Result<Message> {
        let message_type = match msg.message_type.as_str() {
            "q" => MessageType::Request(RequestSpecific {
                method: msg
                    .method
                    .ok_or(Error::InvalidMessage("request without a method"))?,
                arguments: msg
                    .arguments
                    .ok_or(Error::InvalidMessage("request without arguments"))?
                    .try_into()?,
            }),
            "r" => MessageType::Response(
                msg.response
                    .ok_or(Error::InvalidMessage("response without a result"))?
                    .try_into()?,
            ),
            "e" => {
                let error = msg.error.unwrap_or_default();

                MessageType::Error(ErrorSpecific {
                    code: match error.first() {
                        Some(Value::Int(code)) => *code,
                        _ => ERROR_GENERIC,
                    },
                    description: match error.get(1) {
                        Some(Value::Bytes(bytes)) => String::from_utf8_lossy(bytes).to_string(),
                        _ => String::new(),
                    },
                })
            }
            _ => return Err(Error::InvalidMessage("unknown message type")),
        };

        Ok(Message {
            transaction_id: msg.transaction_id,
            version: msg.version,
            message_type,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.clone()
            .into_serde_message()
            .to_bytes()
            .map_err(Error::BencodeError)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Message> {
        Message::from_serde_message(internal::DHTMessage::from_bytes(bytes.as_ref())?)
    }

    /// Return the Id of the sender, from the `id` field of the arguments or the result.
    pub fn get_author_id(&self) -> Option<Id> {
        match &self.message_type {
            MessageType::Request(request) => request.arguments.get_id("id"),
            MessageType::Response(result) => result.get_id("id"),
            MessageType::Error(_) => None,
        }
    }
}

/// Parse the 2 bytes transaction id of our own requests.
pub fn transaction_id(bytes: &[u8]) -> Result<u16> {
    match bytes {
        [a, b] => Ok(u16::from_be_bytes([*a, *b])),
        _ => Err(Error::InvalidTransactionId(bytes.to_vec())),
    }
}

/// Encode an IPv4 socket address as compact peer info.
pub fn peer_to_bytes(address: &SocketAddrV4) -> [u8; COMPACT_PEER_SIZE] {
    let mut bytes = [0_u8; COMPACT_PEER_SIZE];

    bytes[..4].copy_from_slice(&address.ip().octets());
    bytes[4..].copy_from_slice(&address.port().to_be_bytes());

    bytes
}

/// Decode compact peer info.
pub fn bytes_to_peer<T: AsRef<[u8]>>(bytes: T) -> Result<SocketAddrV4> {
    let bytes = bytes.as_ref();

    if bytes.len() != COMPACT_PEER_SIZE {
        return Err(Error::InvalidCompactAddress(bytes.len()));
    }

    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);

    Ok(SocketAddrV4::new(ip, port))
}

/// Encode nodes as concatenated compact node info, skipping nodes without an id.
pub fn nodes_to_bytes(nodes: &[Node]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(nodes.len() * COMPACT_NODE_SIZE);

    for node in nodes {
        if let Some(id) = node.id() {
            bytes.extend_from_slice(id.as_bytes());
            bytes.extend_from_slice(&peer_to_bytes(&node.address));
        }
    }

    bytes
}

/// Decode concatenated compact node info.
pub fn bytes_to_nodes<T: AsRef<[u8]>>(bytes: T) -> Result<Vec<Node>> {
    let bytes = bytes.as_ref();

    if bytes.len() % COMPACT_NODE_SIZE != 0 {
        return Err(Error::InvalidCompactAddress(bytes.len()));
    }

    bytes
        .chunks_exact(COMPACT_NODE_SIZE)
        .map(|chunk| {
            Ok(Node::new(
                Id::from_bytes(&chunk[..ID_SIZE])?,
                bytes_to_peer(&chunk[ID_SIZE..])?,
            ))
        })
        .collect()
}
