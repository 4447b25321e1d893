//! Parser registry.
//!
//! Protocol codecs (HL7, FHIR, SOAP, ...) live outside the core. They plug in
//! here as [`Parser`] implementations keyed by content-type token. The table
//! is assembled once at startup and frozen; lookups never branch on the token.

use bytes::Bytes;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::enums::{CONTENT_TYPE_OCTET_STREAM, CONTENT_TYPE_TEXT};
use crate::types::{BoxError, Error, Result};

/// A parsed payload, produced by a [`Parser`].
pub trait ParsedValue: Any + Send + Sync + fmt::Debug {
    /// Validation capability. `None` means the value has none and the
    /// envelope is trivially valid; `Some(errors)` is valid iff empty.
    fn validate(&self) -> Option<Vec<String>> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Turns raw payload bytes into a [`ParsedValue`].
#[cfg_attr(test, mockall::automock)]
pub trait Parser: Send + Sync {
    fn parse(
        &self,
        raw: &[u8],
        schema_version: &str,
    ) -> std::result::Result<Arc<dyn ParsedValue>, BoxError>;
}

// =============================================================================
// Built-in opaque parser
// =============================================================================

/// Parsed form of an opaque payload: the bytes themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct RawValue {
    pub bytes: Bytes,
    pub schema_version: String,
}

impl RawValue {
    /// UTF-8 view, if the payload is text.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }
}

impl ParsedValue for RawValue {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Parser for `application/octet-stream` and `text/plain`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawParser;

impl Parser for RawParser {
    fn parse(
        &self,
        raw: &[u8],
        schema_version: &str,
    ) -> std::result::Result<Arc<dyn ParsedValue>, BoxError> {
        Ok(Arc::new(RawValue {
            bytes: Bytes::copy_from_slice(raw),
            schema_version: schema_version.to_string(),
        }))
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Frozen content-type → parser table.
#[derive(Clone, Default)]
pub struct ParserRegistry {
    parsers: HashMap<String, Arc<dyn Parser>>,
}

impl fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tokens: Vec<&str> = self.parsers.keys().map(String::as_str).collect();
        tokens.sort_unstable();
        f.debug_struct("ParserRegistry")
            .field("content_types", &tokens)
            .finish()
    }
}

impl ParserRegistry {
    pub fn builder() -> ParserRegistryBuilder {
        ParserRegistryBuilder::default()
    }

    /// Registry with only the built-in opaque parser.
    pub fn with_builtins() -> Self {
        Self::builder().with_builtins().build()
    }

    pub fn resolve(&self, content_type: &str) -> Result<Arc<dyn Parser>> {
        self.parsers
            .get(content_type)
            .cloned()
            .ok_or_else(|| Error::InvalidContentType(content_type.to_string()))
    }

    pub fn contains(&self, content_type: &str) -> bool {
        self.parsers.contains_key(content_type)
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }
}

/// Startup-time builder for [`ParserRegistry`].
#[derive(Default)]
pub struct ParserRegistryBuilder {
    parsers: HashMap<String, Arc<dyn Parser>>,
}

impl fmt::Debug for ParserRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParserRegistryBuilder")
            .field("registered", &self.parsers.len())
            .finish()
    }
}

impl ParserRegistryBuilder {
    /// Register a parser. A later registration for the same token wins.
    pub fn register(mut self, content_type: impl Into<String>, parser: Arc<dyn Parser>) -> Self {
        self.parsers.insert(content_type.into(), parser);
        self
    }

    pub fn with_builtins(self) -> Self {
        let raw: Arc<dyn Parser> = Arc::new(RawParser);
        self.register(CONTENT_TYPE_OCTET_STREAM, Arc::clone(&raw))
            .register(CONTENT_TYPE_TEXT, raw)
    }

    pub fn build(self) -> ParserRegistry {
        ParserRegistry {
            parsers: self.parsers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_token_is_invalid_content_type() {
        let registry = ParserRegistry::with_builtins();
        let err = registry.resolve("application/x12").err().unwrap();
        assert!(matches!(err, Error::InvalidContentType(t) if t == "application/x12"));
    }

    #[test]
    fn test_builtin_parser_keeps_bytes() {
        let registry = ParserRegistry::with_builtins();
        let parser = registry.resolve(CONTENT_TYPE_TEXT).unwrap();
        let parsed = parser.parse(b"hello", "1").unwrap();
        let raw = parsed.as_any().downcast_ref::<RawValue>().unwrap();
        assert_eq!(raw.text(), Some("hello"));
        assert!(parsed.validate().is_none());
    }

    #[test]
    fn test_later_registration_wins() {
        let mut mock = MockParser::new();
        mock.expect_parse().returning(|raw, _| {
            Ok(Arc::new(RawValue {
                bytes: Bytes::copy_from_slice(raw),
                schema_version: "mock".into(),
            }) as Arc<dyn ParsedValue>)
        });

        let registry = ParserRegistry::builder()
            .with_builtins()
            .register(CONTENT_TYPE_TEXT, Arc::new(mock))
            .build();
        let parsed = registry.resolve(CONTENT_TYPE_TEXT).unwrap().parse(b"x", "1").unwrap();
        let raw = parsed.as_any().downcast_ref::<RawValue>().unwrap();
        assert_eq!(raw.schema_version, "mock");
        assert_eq!(registry.len(), 2);
    }
}
