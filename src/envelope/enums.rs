//! Envelope header enumerations and well-known tokens.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Error, Result};

/// Content-type token for HL7 v2 payloads.
pub const CONTENT_TYPE_HL7V2: &str = "application/hl7-v2";
/// Content-type token for FHIR JSON payloads.
pub const CONTENT_TYPE_FHIR_JSON: &str = "application/fhir+json";
/// Opaque binary payload.
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";
/// Opaque text payload.
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

/// Delivery priority, 0 (lowest) to 9 (highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const LOWEST: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(5);
    pub const HIGHEST: Priority = Priority(9);

    pub fn new(value: u8) -> Result<Self> {
        if value > Self::HIGHEST.0 {
            return Err(Error::validation(format!(
                "priority must be 0-9, got {}",
                value
            )));
        }
        Ok(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Body type tag, fixed by the protocol family that created the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyType {
    Hl7v2,
    Fhir,
    Raw,
    /// Any other protocol family, named by its adapter.
    Other(String),
}

impl BodyType {
    /// Default tag for a content-type token.
    pub fn for_content_type(content_type: &str) -> Self {
        match content_type {
            CONTENT_TYPE_HL7V2 => BodyType::Hl7v2,
            CONTENT_TYPE_FHIR_JSON => BodyType::Fhir,
            _ => BodyType::Raw,
        }
    }
}
