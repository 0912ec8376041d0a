//! # Wire Frames
//!
//! Two protocols meet in the bridge:
//!
//! - **Viewer protocol**: JSON text frames over the WebSocket. The bridge sends
//!   [`ServerFrame`]s and receives [`ViewerFrame`]s.
//! - **PTY host protocol**: newline-delimited JSON over the host subprocess's
//!   standard streams. The bridge writes [`HostCommand`]s and reads
//!   [`HostMessage`]s. Terminal bytes travel base64-encoded.
//!
//! ```text
//! viewer ──{"type":"input","data":"ls\r"}──────────► bridge
//! bridge ──{"type":"input","data":"bHMN"}──────────► PTY host
//! PTY host ─{"type":"output","data":"aGkNCg=="}────► bridge
//! bridge ──{"type":"output","data":"hi\r\n"}───────► viewer
//! PTY host ─{"type":"exit","code":0,"signal":null}─► bridge
//! bridge ──{"type":"exit","code":0}────────────────► viewer
//! ```

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Frame sent from the bridge to every viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Decoded terminal output.
    Output { data: String },
    /// The child process ended. Absent fields are omitted from the JSON.
    Exit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
}

impl ServerFrame {
    pub fn output(data: impl Into<String>) -> Self {
        ServerFrame::Output { data: data.into() }
    }

    pub fn exit(status: ExitStatus) -> Self {
        ServerFrame::Exit {
            code: status.code,
            signal: status.signal,
        }
    }

    /// Serializes the frame for a text WebSocket message.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Frame received from a viewer.
///
/// Resize dimensions are kept as raw JSON numbers so that fractional or
/// negative values survive parsing and can be rejected by validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ViewerFrame {
    Input { data: String },
    Resize { cols: f64, rows: f64 },
}

impl ViewerFrame {
    /// Parses one text message from a viewer.
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Validates a requested terminal size.
///
/// Both values must be finite and at least 1 after truncation toward zero,
/// and must fit a PTY dimension.
pub fn terminal_size(cols: f64, rows: f64) -> Option<(u16, u16)> {
    fn dimension(value: f64) -> Option<u16> {
        if !value.is_finite() {
            return None;
        }
        let value = value.trunc();
        if value < 1.0 || value > f64::from(u16::MAX) {
            return None;
        }
        Some(value as u16)
    }

    Some((dimension(cols)?, dimension(rows)?))
}

/// Control message written to the PTY host's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HostCommand {
    /// Base64-encoded bytes for the PTY.
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

/// Control message read from the PTY host's stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HostMessage {
    /// Base64-encoded bytes read from the PTY.
    Output { data: String },
    Exit {
        #[serde(default)]
        code: Option<i32>,
        #[serde(default)]
        signal: Option<i32>,
    },
}

/// How the child process ended. Either field may be unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// Maps the status onto a process exit code the way shells do.
    pub fn process_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => 1,
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        ExitStatus {
            code: status.code(),
            signal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_frame_json() {
        let json = ServerFrame::output("hi\r\n").to_json().unwrap();
        assert_eq!(json, r#"{"type":"output","data":"hi\r\n"}"#);
    }

    #[test]
    fn test_exit_frame_omits_unknown_fields() {
        let frame = ServerFrame::exit(ExitStatus {
            code: Some(0),
            signal: None,
        });
        assert_eq!(frame.to_json().unwrap(), r#"{"type":"exit","code":0}"#);

        let frame = ServerFrame::exit(ExitStatus::default());
        assert_eq!(frame.to_json().unwrap(), r#"{"type":"exit"}"#);
    }

    #[test]
    fn test_parse_viewer_input() {
        let frame = ViewerFrame::parse(r#"{"type":"input","data":"ls\r"}"#).unwrap();
        assert_eq!(
            frame,
            ViewerFrame::Input {
                data: "ls\r".to_string()
            }
        );
    }

    #[test]
    fn test_parse_fractional_resize() {
        let frame = ViewerFrame::parse(r#"{"type":"resize","cols":80.7,"rows":-1}"#).unwrap();
        assert_eq!(
            frame,
            ViewerFrame::Resize {
                cols: 80.7,
                rows: -1.0
            }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_and_malformed() {
        assert!(ViewerFrame::parse("not json").is_err());
        assert!(ViewerFrame::parse(r#"{"type":"ping"}"#).is_err());
        assert!(ViewerFrame::parse(r#"{"type":"resize","cols":"80","rows":24}"#).is_err());
        assert!(ViewerFrame::parse(r#"{"type":"input"}"#).is_err());
    }

    #[test]
    fn test_terminal_size_validation() {
        assert_eq!(terminal_size(80.0, 24.0), Some((80, 24)));
        assert_eq!(terminal_size(80.7, 24.2), Some((80, 24)));
        assert_eq!(terminal_size(80.7, -1.0), None);
        assert_eq!(terminal_size(0.0, 24.0), None);
        assert_eq!(terminal_size(0.5, 24.0), None);
        assert_eq!(terminal_size(f64::NAN, 24.0), None);
        assert_eq!(terminal_size(80.0, f64::INFINITY), None);
        assert_eq!(terminal_size(70000.0, 24.0), None);
    }

    #[test]
    fn test_host_command_json() {
        let resize = HostCommand::Resize { cols: 80, rows: 24 };
        assert_eq!(
            serde_json::to_string(&resize).unwrap(),
            r#"{"type":"resize","cols":80,"rows":24}"#
        );
    }

    #[test]
    fn test_host_exit_message_with_nulls() {
        let msg: HostMessage =
            serde_json::from_str(r#"{"type":"exit","code":null,"signal":9}"#).unwrap();
        assert_eq!(
            msg,
            HostMessage::Exit {
                code: None,
                signal: Some(9)
            }
        );

        let msg: HostMessage = serde_json::from_str(r#"{"type":"exit"}"#).unwrap();
        assert_eq!(
            msg,
            HostMessage::Exit {
                code: None,
                signal: None
            }
        );
    }

    #[test]
    fn test_process_code() {
        let exited = ExitStatus {
            code: Some(3),
            signal: None,
        };
        let killed = ExitStatus {
            code: None,
            signal: Some(9),
        };
        assert_eq!(exited.process_code(), 3);
        assert_eq!(killed.process_code(), 137);
        assert_eq!(ExitStatus::default().process_code(), 1);
    }
}
