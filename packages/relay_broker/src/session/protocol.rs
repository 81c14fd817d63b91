//! Frames exchanged on the RPC channel before a connection switches to relay.
//!
//! Every frame is a JSON object carried by the length-prefixed codec in
//! [`crate::transport::framing`]. Binary fields travel as lowercase hex.
//!
//! Client → server: [`ClientFrame::Call`] invokes a broker operation,
//! [`ClientFrame::CallbackResult`] acknowledges a server callback.
//!
//! Server → client: [`ServerFrame::Reply`] answers a call,
//! [`ServerFrame::Callback`] invokes one of the client's exported operations.

use serde::{Deserialize, Serialize};

use crate::error::ErrorResponse;
use crate::token::{TOKEN_LEN, Token};

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    Call {
        id: u64,
        call: BrokerCall,
    },
    CallbackResult {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Broker operations a client can invoke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum BrokerCall {
    Version {
        version: u8,
    },
    Register {
        #[serde(with = "hex")]
        app_id: Vec<u8>,
        #[serde(with = "hex")]
        public_id: Vec<u8>,
        #[serde(with = "hex")]
        registration_key: Vec<u8>,
    },
    Authenticate {
        #[serde(with = "hex")]
        app_id: Vec<u8>,
        #[serde(with = "hex")]
        public_id: Vec<u8>,
        #[serde(with = "hex")]
        secret_key: Vec<u8>,
    },
    ConnectTo {
        #[serde(with = "hex")]
        public_id: Vec<u8>,
        correlation_id: u64,
    },
    AcceptConnection {
        token: Token,
    },
    RejectConnection {
        token: Token,
    },
}

impl BrokerCall {
    /// Method name, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Version { .. } => "Version",
            Self::Register { .. } => "Register",
            Self::Authenticate { .. } => "Authenticate",
            Self::ConnectTo { .. } => "ConnectTo",
            Self::AcceptConnection { .. } => "AcceptConnection",
            Self::RejectConnection { .. } => "RejectConnection",
        }
    }
}

/// Messages sent by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    Reply { id: u64, result: CallResult },
    Callback { id: u64, call: RemoteCall },
}

impl ServerFrame {
    /// After this frame the connection carries raw relay bytes.
    pub fn starts_relay(&self) -> bool {
        matches!(
            self,
            Self::Callback {
                call: RemoteCall::InitializeConnection { .. },
                ..
            }
        )
    }
}

/// Outcome of a broker call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallResult {
    Ok { value: CallValue },
    Error(ErrorResponse),
}

/// Successful call payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallValue {
    Unit,
    SecretKey {
        #[serde(with = "hex")]
        secret_key: [u8; TOKEN_LEN],
    },
}

/// Operations the broker invokes on a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum RemoteCall {
    IncomingConnection {
        token: Token,
        correlation_id: u64,
        #[serde(with = "hex")]
        initiator: Vec<u8>,
    },
    InitializeConnection {
        token: Token,
    },
    ErrorConnection {
        token: Token,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_frame_shape() {
        let frame = ClientFrame::Call {
            id: 3,
            call: BrokerCall::ConnectTo {
                public_id: b"bob".to_vec(),
                correlation_id: 42,
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "Call");
        assert_eq!(json["id"], 3);
        assert_eq!(json["call"]["method"], "ConnectTo");
        assert_eq!(json["call"]["public_id"], "626f62");
        assert_eq!(json["call"]["correlation_id"], 42);
    }

    #[test]
    fn callback_result_error_is_optional() {
        let ok: ClientFrame = serde_json::from_str(r#"{"type":"CallbackResult","id":9}"#).unwrap();
        assert_eq!(ok, ClientFrame::CallbackResult { id: 9, error: None });

        let json = serde_json::to_string(&ClientFrame::CallbackResult { id: 9, error: None }).unwrap();
        assert!(!json.contains("error"));
    }

    #[test]
    fn reply_error_shape() {
        let frame = ServerFrame::Reply {
            id: 1,
            result: CallResult::Error(ErrorResponse {
                code: "unknown_connection".into(),
                message: "unknown connection".into(),
            }),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["result"]["status"], "error");
        assert_eq!(json["result"]["code"], "unknown_connection");

        let back: ServerFrame = serde_json::from_value(json).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn secret_key_is_hex() {
        let frame = ServerFrame::Reply {
            id: 2,
            result: CallResult::Ok {
                value: CallValue::SecretKey {
                    secret_key: [0xaa; TOKEN_LEN],
                },
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["result"]["value"]["kind"], "secret_key");
        assert_eq!(json["result"]["value"]["secret_key"], "aa".repeat(32));
    }

    #[test]
    fn only_initialize_starts_relay() {
        let token = Token::from_bytes([1; TOKEN_LEN]);
        let init = ServerFrame::Callback {
            id: 1,
            call: RemoteCall::InitializeConnection { token },
        };
        let err = ServerFrame::Callback {
            id: 2,
            call: RemoteCall::ErrorConnection {
                token,
                message: "nope".into(),
            },
        };
        assert!(init.starts_relay());
        assert!(!err.starts_relay());
    }

    #[test]
    fn unknown_method_is_rejected() {
        let raw = r#"{"type":"Call","id":1,"call":{"method":"Teleport"}}"#;
        assert!(serde_json::from_str::<ClientFrame>(raw).is_err());
    }
}
