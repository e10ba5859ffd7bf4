//! Control-channel command vocabulary.
//!
//! Each connection carries exactly one JSON request and one JSON response.
//! Commands are a tagged union rather than delimited strings, so a
//! malformed argument is a structured `bad_request` instead of a parsing
//! accident.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::config::{ConfigStub, RemoteConfig};
use crate::token::{Permissions, TransferToken};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "args", rename_all = "snake_case")]
pub enum Request {
    InitServer { remote: RemoteConfig },
    GetConfig,
    CreateBucket { bucket: String },
    CreateSubfolder { bucket: String, subfolder: String },
    CreateToken {
        bucket: String,
        permissions: Permissions,
        ttl_secs: i64,
    },
    ValidateToken { token_id: Uuid },
    RevokeToken { token_id: Uuid },
    LogTransfer { entry: AuditEntry },
}

const KNOWN_COMMANDS: &[&str] = &[
    "init_server",
    "get_config",
    "create_bucket",
    "create_subfolder",
    "create_token",
    "validate_token",
    "revoke_token",
    "log_transfer",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    UnknownCommand,
    AlreadyInitialized,
    NotInitialized,
    /// Covers both not-found and expired; callers cannot tell them apart.
    InvalidToken,
    EmptyPermissions,
    PermissionDenied,
    AuthFailed,
    Remote,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Ok { message: String },
    Initialized { message: String, client_key: String },
    Config { config: ConfigStub },
    Token { token: TransferToken },
    Error { code: ErrorCode, message: String },
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Response::Ok {
            message: message.into(),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed wire payload: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode_response(payload: &[u8]) -> Result<Response, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Decode an incoming command payload. On failure the `Err` side carries
/// the structured error response to send back: `unknown_command` for a
/// well-formed envelope naming a command we do not have, `bad_request` for
/// everything else.
pub fn decode_request(payload: &[u8]) -> Result<Request, Response> {
    match serde_json::from_slice::<Request>(payload) {
        Ok(request) => Ok(request),
        Err(_) => {
            let value: serde_json::Value = match serde_json::from_slice(payload) {
                Ok(v) => v,
                Err(e) => {
                    return Err(Response::error(
                        ErrorCode::BadRequest,
                        format!("payload is not valid json: {e}"),
                    ))
                }
            };
            match value.get("cmd").and_then(|c| c.as_str()) {
                Some(name) if !KNOWN_COMMANDS.contains(&name) => Err(Response::error(
                    ErrorCode::UnknownCommand,
                    format!("unknown command '{name}'"),
                )),
                Some(name) => Err(Response::error(
                    ErrorCode::BadRequest,
                    format!("bad arguments for '{name}'"),
                )),
                None => Err(Response::error(
                    ErrorCode::BadRequest,
                    "missing 'cmd' field",
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let request = Request::CreateSubfolder {
            bucket: "archive".into(),
            subfolder: "2026".into(),
        };
        let bytes = encode(&request).unwrap();
        assert_eq!(decode_request(&bytes).unwrap(), request);
    }

    #[test]
    fn test_get_config_needs_no_args() {
        let request = decode_request(br#"{"cmd":"get_config"}"#).unwrap();
        assert_eq!(request, Request::GetConfig);
    }

    #[test]
    fn test_unknown_command() {
        let response = decode_request(br#"{"cmd":"drop_bucket","args":{}}"#).unwrap_err();
        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::UnknownCommand,
                ..
            }
        ));
    }

    #[test]
    fn test_bad_arguments_are_bad_request() {
        let response =
            decode_request(br#"{"cmd":"validate_token","args":{"token_id":42}}"#).unwrap_err();
        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::BadRequest,
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_json_is_bad_request() {
        for payload in [&b"not json"[..], b"", b"[1,2,3]"] {
            let response = decode_request(payload).unwrap_err();
            assert!(
                matches!(
                    response,
                    Response::Error {
                        code: ErrorCode::BadRequest,
                        ..
                    }
                ),
                "payload {payload:?}"
            );
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let response = Response::error(ErrorCode::InvalidToken, "invalid or expired token");
        let bytes = encode(&response).unwrap();
        assert_eq!(decode_response(&bytes).unwrap(), response);
    }
}
