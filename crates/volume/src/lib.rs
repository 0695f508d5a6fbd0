//! estack volume: capability negotiation for the bind-mount volume plugin.
//!
//! The orchestration volume subsystem calls the plugin binary with a command name and
//! reads one JSON response from stdout.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Whether attach/detach are separate steps from mount/unmount.
    pub attach: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    pub message: String,
    pub capabilities: Capabilities,
}

impl Response {
    pub fn failure(message: impl Into<String>) -> Self {
        Self { status: Status::Failure, message: message.into(), capabilities: Capabilities::default() }
    }

    pub fn to_json(&self) -> String {
        // Plain structs with string/bool fields always serialize.
        serde_json::to_string(self).unwrap_or_else(|_| String::from(r#"{"status":"Failure","message":"encoding error","capabilities":{"attach":false}}"#))
    }
}

/// Bind-mount plugin: mount and unmount only, never attach.
#[derive(Debug, Clone, Copy, Default)]
pub struct BindMount;

impl BindMount {
    pub fn init(&self) -> Response {
        Response {
            status: Status::Success,
            message: "driver is available".to_string(),
            capabilities: Capabilities { attach: false },
        }
    }

    /// Answer a plugin call by command name.
    pub fn dispatch(&self, command: &str) -> Response {
        match command {
            "init" => self.init(),
            other => Response::failure(format!("command {} is not supported by this responder", other)),
        }
    }
}
