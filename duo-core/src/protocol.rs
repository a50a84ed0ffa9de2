//! Duo wire protocol: envelope kinds, payloads, and discovery datagrams.

use serde::{Deserialize, Serialize};

/// Current protocol version. Advertised in `peerInfo`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Handshake proof: first application message each side sends after the transport opens.
pub const PEER_INFO: &str = "peerInfo";
pub const FILE_TRANSFER_INIT: &str = "fileTransferInit";
pub const FILE_CHUNK: &str = "fileChunk";
pub const FILE_CHUNK_ACK: &str = "fileChunkAck";
pub const FILE_TRANSFER_COMPLETE: &str = "fileTransferComplete";
pub const TRANSFER_VERIFIED: &str = "transferVerified";
pub const FILE_TRANSFER_CANCEL: &str = "fileTransferCancel";

const MAX_DATAGRAM_LEN: usize = 64 * 1024;

/// Fresh transfer id (UUID v4, hyphenated).
pub fn new_transfer_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Which side of the pairing a device is. Discovery only tracks the counterpart kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Desktop,
    Mobile,
}

impl DeviceKind {
    pub fn counterpart(self) -> Self {
        match self {
            DeviceKind::Desktop => DeviceKind::Mobile,
            DeviceKind::Mobile => DeviceKind::Desktop,
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Desktop => f.write_str("desktop"),
            DeviceKind::Mobile => f.write_str("mobile"),
        }
    }
}

impl std::str::FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "desktop" => Ok(DeviceKind::Desktop),
            "mobile" => Ok(DeviceKind::Mobile),
            other => Err(format!("unknown device kind: {other}")),
        }
    }
}

/// `peerInfo` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
    pub device_type: DeviceKind,
    #[serde(default)]
    pub version: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferInit {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub chunk_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunk {
    pub id: String,
    pub index: u32,
    /// Base64 of the chunk bytes.
    pub chunk: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChunkAck {
    pub id: String,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTransferComplete {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferVerified {
    pub id: String,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTransferCancel {
    pub id: String,
}

/// Target carried by a `wakeUpRequest`: where the sender wants to be reconnected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeUpTarget {
    #[serde(rename = "macIP")]
    pub ip: String,
    #[serde(rename = "macPort")]
    pub port: u16,
    #[serde(rename = "macName", default)]
    pub name: String,
}

/// UDP discovery datagrams. JSON body, one datagram per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Datagram {
    #[serde(rename = "presence")]
    Presence {
        #[serde(rename = "deviceType")]
        device_type: DeviceKind,
        id: String,
        name: String,
        ips: Vec<String>,
        #[serde(default)]
        port: u16,
    },
    #[serde(rename = "bye")]
    Bye {
        #[serde(rename = "deviceType")]
        device_type: DeviceKind,
        id: String,
    },
    #[serde(rename = "wakeUpRequest")]
    WakeUpRequest { data: WakeUpTarget },
}

pub fn encode_datagram(datagram: &Datagram) -> Result<Vec<u8>, DatagramError> {
    let bytes = serde_json::to_vec(datagram).map_err(DatagramError::Encode)?;
    if bytes.len() > MAX_DATAGRAM_LEN {
        return Err(DatagramError::TooLarge);
    }
    Ok(bytes)
}

pub fn decode_datagram(bytes: &[u8]) -> Result<Datagram, DatagramError> {
    if bytes.len() > MAX_DATAGRAM_LEN {
        return Err(DatagramError::TooLarge);
    }
    serde_json::from_slice(bytes).map_err(DatagramError::Decode)
}

#[derive(Debug, thiserror::Error)]
pub enum DatagramError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("datagram too large")]
    TooLarge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_ids_are_unique_uuids() {
        let a = new_transfer_id();
        assert_eq!(a.len(), 36);
        assert_ne!(a, new_transfer_id());
    }

    #[test]
    fn presence_wire_shape() {
        let d = Datagram::Presence {
            device_type: DeviceKind::Desktop,
            id: "abc".into(),
            name: "Studio".into(),
            ips: vec!["192.168.1.4".into()],
            port: 6996,
        };
        let v: serde_json::Value = serde_json::from_slice(&encode_datagram(&d).unwrap()).unwrap();
        assert_eq!(v["type"], "presence");
        assert_eq!(v["deviceType"], "desktop");
        assert_eq!(v["ips"][0], "192.168.1.4");
        assert_eq!(v["port"], 6996);
    }

    #[test]
    fn parses_wake_up_request() {
        let raw = br#"{"type":"wakeUpRequest","data":{"macIP":"10.0.0.2","macPort":6996,"macName":"Studio"}}"#;
        match decode_datagram(raw).unwrap() {
            Datagram::WakeUpRequest { data } => {
                assert_eq!(data.ip, "10.0.0.2");
                assert_eq!(data.port, 6996);
                assert_eq!(data.name, "Studio");
            }
            other => panic!("expected wake-up, got {other:?}"),
        }
    }

    #[test]
    fn parses_bye_and_rejects_unknown_type() {
        let bye = decode_datagram(br#"{"type":"bye","deviceType":"mobile","id":"x"}"#).unwrap();
        assert!(matches!(bye, Datagram::Bye { device_type: DeviceKind::Mobile, .. }));
        assert!(decode_datagram(br#"{"type":"hello"}"#).is_err());
        assert!(decode_datagram(b"\x00\x01garbage").is_err());
    }

    #[test]
    fn init_uses_camel_case_and_optional_checksum() {
        let init = FileTransferInit {
            id: "t".into(),
            name: "a.txt".into(),
            size: 3,
            mime: "text/plain".into(),
            chunk_size: 1024,
            checksum: None,
        };
        let v = serde_json::to_value(&init).unwrap();
        assert_eq!(v["chunkSize"], 1024);
        assert!(v.get("checksum").is_none());
        let back: FileTransferInit = serde_json::from_value(v).unwrap();
        assert_eq!(back, init);
    }

    #[test]
    fn device_kind_parse() {
        assert_eq!("Desktop".parse::<DeviceKind>().unwrap(), DeviceKind::Desktop);
        assert_eq!(DeviceKind::Mobile.counterpart(), DeviceKind::Desktop);
        assert!("tablet".parse::<DeviceKind>().is_err());
    }
}
