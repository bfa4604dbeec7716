use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTMessage {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    #[serde(rename = "y")]
    pub message_type: String,

    #[serde(default, rename = "q", skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, rename = "a", skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,

    #[serde(default, rename = "r", skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,

    #[serde(default, rename = "e", skip_serializing_if = "Option::is_none")]
    pub error: Option<Vec<Value>>,

    #[serde(
        default,
        rename = "v",
        with = "serde_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub version: Option<Vec<u8>>,
}

impl DHTMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<DHTMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}
