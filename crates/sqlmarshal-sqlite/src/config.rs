///
/// # Connection Configuration
///
/// Options fixed when a connection is opened. They can be built in code or
/// read from a TOML table:
///
/// ```toml
/// text_encoding = "utf16"
/// read_only = false
/// create_if_missing = true
/// busy_timeout_ms = 250
/// ```
///
/// `text_encoding` selects the width used for SQL text, bound text,
/// column reads, and function registration for the connection's lifetime.
///

use serde::{Deserialize, Serialize};
use sqlmarshal_core::{Result, TextEncoding};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub text_encoding: TextEncoding,
    pub read_only: bool,
    pub create_if_missing: bool,
    pub busy_timeout_ms: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            text_encoding: TextEncoding::Utf8,
            read_only: false,
            create_if_missing: true,
            busy_timeout_ms: None,
        }
    }
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn with_text_encoding(mut self, encoding: TextEncoding) -> Self {
        self.text_encoding = encoding;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_busy_timeout(mut self, millis: u32) -> Self {
        self.busy_timeout_ms = Some(millis);
        self
    }

    pub(crate) fn open_flags(&self) -> std::ffi::c_int {
        use rusqlite::ffi;

        if self.read_only {
            ffi::SQLITE_OPEN_READONLY
        } else if self.create_if_missing {
            ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE
        } else {
            ffi::SQLITE_OPEN_READWRITE
        }
    }
}
