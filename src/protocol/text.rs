//! Text (JSON) control frames: spec §3 Frame, §6.1.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WireErrorCode;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AuthMode {
    Password,
    PublicKey,
    Agent,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectAuth {
    pub password: Option<String>,
    #[serde(rename = "privateKey")]
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
    #[serde(default)]
    pub mode: Option<AuthMode>,
    /// References a `CredentialRecord` in the Store (spec §6.5) instead of
    /// carrying plaintext; resolved through the Vault at connect time.
    #[serde(default, rename = "credentialId")]
    pub credential_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SftpEntry {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
    #[serde(rename = "isDir")]
    pub is_dir: bool,
    #[serde(rename = "isSymlink")]
    pub is_symlink: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TextFrame {
    #[serde(rename = "connect")]
    Connect {
        host: String,
        port: u16,
        user: String,
        auth: ConnectAuth,
    },
    #[serde(rename = "connected")]
    Connected { #[serde(rename = "serverVersion")] server_version: String },
    #[serde(rename = "disconnect")]
    Disconnect,
    #[serde(rename = "error")]
    Error {
        code: WireErrorCode,
        message: String,
        retryable: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation_id: Option<String>,
    },
    #[serde(rename = "ping")]
    Ping { t: i64 },
    #[serde(rename = "pong")]
    Pong { t: i64, #[serde(rename = "tServer")] t_server: i64 },

    #[serde(rename = "terminal.open")]
    TerminalOpen {
        cols: u32,
        rows: u32,
        #[serde(default)]
        term: Option<String>,
    },
    #[serde(rename = "terminal.resize")]
    TerminalResize { cols: u32, rows: u32 },
    #[serde(rename = "terminal.exit")]
    TerminalExit {
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },

    #[serde(rename = "sftp.list")]
    SftpList { #[serde(rename = "operationId")] operation_id: String, path: String },
    #[serde(rename = "sftp.mkdir")]
    SftpMkdir {
        #[serde(rename = "operationId")]
        operation_id: String,
        path: String,
        #[serde(default)]
        mode: Option<u32>,
        #[serde(default)]
        recursive: bool,
    },
    #[serde(rename = "sftp.rename")]
    SftpRename { #[serde(rename = "operationId")] operation_id: String, from: String, to: String },
    #[serde(rename = "sftp.chmod")]
    SftpChmod { #[serde(rename = "operationId")] operation_id: String, path: String, mode: u32 },
    #[serde(rename = "sftp.delete")]
    SftpDelete {
        #[serde(rename = "operationId")]
        operation_id: String,
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    #[serde(rename = "sftp.upload")]
    SftpUpload { #[serde(rename = "operationId")] operation_id: String, path: String, size: u64 },
    #[serde(rename = "sftp.upload-ready")]
    SftpUploadReady {
        #[serde(rename = "operationId")]
        operation_id: String,
        #[serde(rename = "chunkSize")]
        chunk_size: u32,
        window: u32,
    },
    #[serde(rename = "sftp.upload-ack")]
    SftpUploadAck { #[serde(rename = "operationId")] operation_id: String, seq: u32 },
    #[serde(rename = "sftp.download")]
    SftpDownload { #[serde(rename = "operationId")] operation_id: String, path: String },
    #[serde(rename = "sftp.downloadFolder")]
    SftpDownloadFolder { #[serde(rename = "operationId")] operation_id: String, path: String },
    #[serde(rename = "sftp.downloadFolder-ready")]
    SftpDownloadFolderReady { #[serde(rename = "operationId")] operation_id: String, format: String },
    #[serde(rename = "sftp.cancel")]
    SftpCancel { #[serde(rename = "operationId")] operation_id: String },

    #[serde(rename = "sftp.progress")]
    SftpProgress {
        #[serde(rename = "operationId")]
        operation_id: String,
        #[serde(rename = "bytesDone")]
        bytes_done: u64,
        #[serde(rename = "bytesTotal", skip_serializing_if = "Option::is_none")]
        bytes_total: Option<u64>,
    },
    #[serde(rename = "sftp.done")]
    SftpDone {
        #[serde(rename = "operationId")]
        operation_id: String,
        #[serde(flatten)]
        result: Value,
    },
    #[serde(rename = "sftp.failed")]
    SftpFailed {
        #[serde(rename = "operationId")]
        operation_id: String,
        code: WireErrorCode,
        message: String,
    },
    #[serde(rename = "sftp.cancelled")]
    SftpCancelled { #[serde(rename = "operationId")] operation_id: String },

    #[serde(rename = "telemetry.sample")]
    TelemetrySample { #[serde(flatten)] sample: Value },
    #[serde(rename = "telemetry.error")]
    TelemetryError { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_round_trips() {
        let frame = TextFrame::Connect {
            host: "h".into(),
            port: 22,
            user: "u".into(),
            auth: ConnectAuth {
                password: Some("p".into()),
                private_key: None,
                passphrase: None,
                mode: Some(AuthMode::Password),
                credential_id: None,
            },
        };
        let encoded = serde_json::to_string(&frame).unwrap();
        assert!(encoded.contains("\"type\":\"connect\""));
        let decoded: TextFrame = serde_json::from_str(&encoded).unwrap();
        match decoded {
            TextFrame::Connect { host, port, .. } => {
                assert_eq!(host, "h");
                assert_eq!(port, 22);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn dotted_type_names_decode() {
        let raw = r#"{"type":"terminal.open","cols":80,"rows":24}"#;
        let decoded: TextFrame = serde_json::from_str(raw).unwrap();
        assert!(matches!(decoded, TextFrame::TerminalOpen { cols: 80, rows: 24, .. }));
    }

    #[test]
    fn unknown_type_fails_to_decode() {
        let raw = r#"{"type":"not.a.real.type"}"#;
        assert!(serde_json::from_str::<TextFrame>(raw).is_err());
    }
}
