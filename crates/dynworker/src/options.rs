//! Message options and header construction.
//!
//! Options are partial: unset fields fall through to the next layer. A header
//! is layered as client defaults, then a fresh correlation id, then the
//! per-message options, later layers winning.

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::{CorrelationId, Header};

pub const LOG_MESSAGES_ENV: &str = "DYNWORKER_LOG_MESSAGES";
pub const LOG_RESULT_ENV: &str = "DYNWORKER_LOG_RESULT";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Options {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_messages: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_result: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub this_arg: Option<serde_json::Value>,
    /// Caller-defined header fields, carried to the worker untouched.
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logging flags from `DYNWORKER_LOG_MESSAGES` / `DYNWORKER_LOG_RESULT`.
    pub fn from_env() -> Self {
        Self {
            log_messages: env_flag(LOG_MESSAGES_ENV),
            log_result: env_flag(LOG_RESULT_ENV),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_log_messages(mut self, enabled: bool) -> Self {
        self.log_messages = Some(enabled);
        self
    }

    pub fn with_log_result(mut self, enabled: bool) -> Self {
        self.log_result = Some(enabled);
        self
    }

    pub fn with_this_arg(mut self, this_arg: serde_json::Value) -> Self {
        self.this_arg = Some(this_arg);
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// Overlay `other` onto `self`: every field `other` sets wins.
    pub fn merge(&mut self, other: Options) {
        if other.id.is_some() {
            self.id = other.id;
        }
        if other.log_messages.is_some() {
            self.log_messages = other.log_messages;
        }
        if other.log_result.is_some() {
            self.log_result = other.log_result;
        }
        if other.this_arg.is_some() {
            self.this_arg = other.this_arg;
        }
        self.extensions.extend(other.extensions);
    }

    pub fn log_messages(&self) -> bool {
        self.log_messages.unwrap_or(false)
    }

    pub fn log_result(&self) -> bool {
        self.log_result.unwrap_or(false)
    }
}

/// Build the header for one outbound message or callback registration.
pub fn build_header(defaults: &Options, overrides: &Options) -> Header {
    let mut layered = defaults.clone();
    layered.id = Some(CorrelationId::new());
    layered.merge(overrides.clone());

    let mut header = Header::new(layered.id.unwrap_or_default());
    header.log_messages = layered.log_messages.unwrap_or(false);
    header.log_result = layered.log_result.unwrap_or(false);
    header.this_arg = layered.this_arg;
    header.extensions = layered.extensions;
    // Extensions must not shadow the typed fields on the wire.
    for key in ["id", "logMessages", "logResult", "thisArg"] {
        header.extensions.remove(key);
    }
    header
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|raw| parse_flag(&raw))
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
