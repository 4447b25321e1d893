//! Envelope - the immutable unit of data flowing between hosts.
//!
//! An envelope is a header (identity, routing, schema metadata, delivery
//! fields, custom properties) plus a body (schema reference, raw payload,
//! validation state, custom properties).
//!
//! The raw payload is the single source of truth. The parsed representation
//! is a lazily filled cache that never reaches the wire: it is skipped on
//! serialization and empty after deserialization. Nothing hands out `&mut`
//! access; every "edit" is a copy-producing function returning a new value.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::types::{CorrelationId, Error, MessageId, Result};

pub mod codec;
pub mod enums;
pub mod parser;
pub mod properties;

pub use codec::{EnvelopeCodec, JsonCodec, MsgPackCodec};
pub use enums::*;
pub use parser::{ParsedValue, Parser, ParserRegistry, ParserRegistryBuilder, RawParser, RawValue};
pub use properties::{Properties, PropertyValue};

// =============================================================================
// Header
// =============================================================================

/// Envelope header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    // Identity
    pub message_id: MessageId,
    pub correlation_id: CorrelationId,
    pub created_at: DateTime<Utc>,

    // Routing
    pub source: String,
    pub destination: String,

    // Schema metadata
    pub body_type: BodyType,
    pub content_type: String,
    pub schema_version: String,
    pub encoding: String,

    // Delivery
    pub priority: Priority,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Properties::is_empty")]
    pub properties: Properties,
}

// =============================================================================
// Body
// =============================================================================

/// Outcome of [`Envelope::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationState {
    #[serde(default)]
    pub validated: bool,

    #[serde(default)]
    pub errors: Vec<String>,
}

/// Write-once validation slot. Serialized as a [`ValidationState`].
#[derive(Debug, Clone, Default)]
pub struct ValidationSlot(OnceLock<ValidationState>);

impl ValidationSlot {
    pub fn get(&self) -> Option<&ValidationState> {
        self.0.get()
    }
}

impl PartialEq for ValidationSlot {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl Serialize for ValidationSlot {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.get().cloned().unwrap_or_default().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ValidationSlot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let state = ValidationState::deserialize(deserializer)?;
        if state.validated || !state.errors.is_empty() {
            Ok(Self(OnceLock::from(state)))
        } else {
            Ok(Self::default())
        }
    }
}

/// Parsed-value cache. Never serialized.
#[derive(Debug, Clone, Default)]
struct ParsedSlot(OnceLock<Arc<dyn ParsedValue>>);

/// Envelope body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Body {
    pub schema_name: String,
    pub schema_namespace: String,
    pub raw_payload: Bytes,

    #[serde(default)]
    pub validation: ValidationSlot,

    #[serde(default, skip_serializing_if = "Properties::is_empty")]
    pub properties: Properties,

    #[serde(skip)]
    parsed: ParsedSlot,
}

impl Body {
    fn new(schema_name: String, schema_namespace: String, raw_payload: Bytes) -> Self {
        Self {
            schema_name,
            schema_namespace,
            raw_payload,
            validation: ValidationSlot::default(),
            properties: Properties::new(),
            parsed: ParsedSlot::default(),
        }
    }

    pub fn is_parsed(&self) -> bool {
        self.parsed.0.get().is_some()
    }

    /// Same schema reference and payload, derived state cleared.
    fn with_payload(&self, raw_payload: Bytes) -> Self {
        Self {
            raw_payload,
            validation: ValidationSlot::default(),
            parsed: ParsedSlot::default(),
            ..self.clone()
        }
    }
}

// The cache is derived state and takes no part in equality.
impl PartialEq for Body {
    fn eq(&self, other: &Self) -> bool {
        self.schema_name == other.schema_name
            && self.schema_namespace == other.schema_namespace
            && self.raw_payload == other.raw_payload
            && self.validation == other.validation
            && self.properties == other.properties
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// Immutable message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    header: Header,
    body: Body,
}

impl Envelope {
    /// Create an envelope, checking that a parser exists for the token.
    pub fn create(
        parsers: &ParserRegistry,
        content_type: &str,
        raw_payload: impl Into<Bytes>,
        schema_version: &str,
        source: &str,
        destination: &str,
        priority: Priority,
    ) -> Result<Self> {
        EnvelopeBuilder::new(content_type, raw_payload)
            .schema_version(schema_version)
            .source(source)
            .destination(destination)
            .priority(priority)
            .build(parsers)
    }

    /// HL7 v2 factory.
    pub fn hl7(
        parsers: &ParserRegistry,
        raw_payload: impl Into<Bytes>,
        schema_version: &str,
        source: &str,
        destination: &str,
    ) -> Result<Self> {
        EnvelopeBuilder::new(CONTENT_TYPE_HL7V2, raw_payload)
            .body_type(BodyType::Hl7v2)
            .schema("HL7", "urn:hl7-org:v2")
            .schema_version(schema_version)
            .source(source)
            .destination(destination)
            .build(parsers)
    }

    /// FHIR JSON factory.
    pub fn fhir(
        parsers: &ParserRegistry,
        raw_payload: impl Into<Bytes>,
        schema_version: &str,
        source: &str,
        destination: &str,
    ) -> Result<Self> {
        EnvelopeBuilder::new(CONTENT_TYPE_FHIR_JSON, raw_payload)
            .body_type(BodyType::Fhir)
            .schema("FHIR", "http://hl7.org/fhir")
            .schema_version(schema_version)
            .source(source)
            .destination(destination)
            .build(parsers)
    }

    pub fn builder(content_type: &str, raw_payload: impl Into<Bytes>) -> EnvelopeBuilder {
        EnvelopeBuilder::new(content_type, raw_payload)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn message_id(&self) -> &MessageId {
        &self.header.message_id
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.header.correlation_id
    }

    pub fn source(&self) -> &str {
        &self.header.source
    }

    pub fn destination(&self) -> &str {
        &self.header.destination
    }

    pub fn content_type(&self) -> &str {
        &self.header.content_type
    }

    pub fn priority(&self) -> Priority {
        self.header.priority
    }

    pub fn retry_count(&self) -> u32 {
        self.header.retry_count
    }

    pub fn raw_payload(&self) -> &Bytes {
        &self.body.raw_payload
    }

    pub fn is_validated(&self) -> bool {
        self.body.validation.get().is_some_and(|s| s.validated)
    }

    pub fn validation_errors(&self) -> &[String] {
        self.body
            .validation
            .get()
            .map(|s| s.errors.as_slice())
            .unwrap_or(&[])
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.header.ttl_ms.map(Duration::from_millis)
    }

    /// Whether the TTL (if any) has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.header.ttl_ms {
            Some(ttl) => {
                let ttl = chrono::Duration::milliseconds(i64::try_from(ttl).unwrap_or(i64::MAX));
                self.header
                    .created_at
                    .checked_add_signed(ttl)
                    .is_some_and(|deadline| deadline <= now)
            }
            None => false,
        }
    }

    // =========================================================================
    // Parse / validate
    // =========================================================================

    /// Parsed representation, computed once and cached.
    ///
    /// A parser failure surfaces as [`Error::Parse`] and leaves both the cache
    /// and the validation state untouched.
    pub fn parse(&self, parsers: &ParserRegistry) -> Result<Arc<dyn ParsedValue>> {
        if let Some(value) = self.body.parsed.0.get() {
            return Ok(Arc::clone(value));
        }
        let parser = parsers.resolve(&self.header.content_type)?;
        let value = parser
            .parse(&self.body.raw_payload, &self.header.schema_version)
            .map_err(|source| Error::Parse {
                content_type: self.header.content_type.clone(),
                source,
            })?;
        Ok(Arc::clone(self.body.parsed.0.get_or_init(|| value)))
    }

    /// Run the parsed value's validation capability (if any) and record it.
    pub fn validate(&self, parsers: &ParserRegistry) -> Result<bool> {
        if let Some(state) = self.body.validation.get() {
            return Ok(state.validated);
        }
        let parsed = self.parse(parsers)?;
        let state = match parsed.validate() {
            None => ValidationState {
                validated: true,
                errors: Vec::new(),
            },
            Some(errors) => ValidationState {
                validated: errors.is_empty(),
                errors,
            },
        };
        Ok(self.body.validation.0.get_or_init(|| state).validated)
    }

    /// Like [`validate`](Self::validate) but raises [`Error::Validation`].
    pub fn ensure_valid(&self, parsers: &ParserRegistry) -> Result<()> {
        if self.validate(parsers)? {
            Ok(())
        } else {
            Err(Error::validation(format!(
                "{}: {}",
                self.header.message_id,
                self.validation_errors().join("; ")
            )))
        }
    }

    // =========================================================================
    // Copy-producing helpers
    // =========================================================================

    /// Fresh identity, same correlation.
    fn derive(&self) -> Self {
        let mut next = self.clone();
        next.header.message_id = MessageId::new();
        next.header.created_at = Utc::now();
        next
    }

    pub fn with_priority(&self, priority: Priority) -> Self {
        let mut next = self.derive();
        next.header.priority = priority;
        next
    }

    /// New payload; parsed cache and validation state start empty.
    pub fn with_payload(&self, raw_payload: impl Into<Bytes>) -> Self {
        let mut next = self.derive();
        next.body = self.body.with_payload(raw_payload.into());
        next
    }

    pub fn readdressed(&self, source: &str, destination: &str) -> Self {
        let mut next = self.derive();
        next.header.source = source.to_string();
        next.header.destination = destination.to_string();
        next
    }

    pub fn with_ttl(&self, ttl: Duration) -> Self {
        let mut next = self.derive();
        next.header.ttl_ms = Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        next
    }

    pub fn with_property(&self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        let mut next = self.derive();
        next.header.properties.insert(key.into(), value.into());
        next
    }

    /// The same message redelivered: identity and creation time are kept so
    /// TTL keeps counting from the first attempt.
    pub fn with_retry_increment(&self) -> Self {
        let mut next = self.clone();
        next.header.retry_count = next.header.retry_count.saturating_add(1);
        next
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} -> {}, {}, p{}]",
            self.header.message_id,
            self.header.source,
            self.header.destination,
            self.header.content_type,
            self.header.priority
        )
    }
}

// =============================================================================
// Builder
// =============================================================================

/// General-purpose envelope builder.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    content_type: String,
    raw_payload: Bytes,
    body_type: Option<BodyType>,
    schema_name: String,
    schema_namespace: String,
    schema_version: String,
    encoding: String,
    source: String,
    destination: String,
    priority: Priority,
    ttl: Option<Duration>,
    correlation_id: Option<CorrelationId>,
    header_properties: Properties,
    body_properties: Properties,
}

impl EnvelopeBuilder {
    pub fn new(content_type: &str, raw_payload: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.to_string(),
            raw_payload: raw_payload.into(),
            body_type: None,
            schema_name: String::new(),
            schema_namespace: String::new(),
            schema_version: String::new(),
            encoding: "utf-8".to_string(),
            source: String::new(),
            destination: String::new(),
            priority: Priority::default(),
            ttl: None,
            correlation_id: None,
            header_properties: Properties::new(),
            body_properties: Properties::new(),
        }
    }

    pub fn body_type(mut self, body_type: BodyType) -> Self {
        self.body_type = Some(body_type);
        self
    }

    pub fn schema(mut self, name: &str, namespace: &str) -> Self {
        self.schema_name = name.to_string();
        self.schema_namespace = namespace.to_string();
        self
    }

    pub fn schema_version(mut self, version: &str) -> Self {
        self.schema_version = version.to_string();
        self
    }

    pub fn encoding(mut self, encoding: &str) -> Self {
        self.encoding = encoding.to_string();
        self
    }

    pub fn source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    pub fn destination(mut self, destination: &str) -> Self {
        self.destination = destination.to_string();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn header_property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.header_properties.insert(key.to_string(), value.into());
        self
    }

    pub fn body_property(mut self, key: &str, value: impl Into<PropertyValue>) -> Self {
        self.body_properties.insert(key.to_string(), value.into());
        self
    }

    /// Fails with [`Error::InvalidContentType`] if no parser is registered.
    pub fn build(self, parsers: &ParserRegistry) -> Result<Envelope> {
        if !parsers.contains(&self.content_type) {
            return Err(Error::InvalidContentType(self.content_type));
        }

        let message_id = MessageId::new();
        let correlation_id = self
            .correlation_id
            .unwrap_or_else(|| CorrelationId::from(&message_id));
        let body_type = self
            .body_type
            .unwrap_or_else(|| BodyType::for_content_type(&self.content_type));

        let mut body = Body::new(self.schema_name, self.schema_namespace, self.raw_payload);
        body.properties = self.body_properties;

        Ok(Envelope {
            header: Header {
                message_id,
                correlation_id,
                created_at: Utc::now(),
                source: self.source,
                destination: self.destination,
                body_type,
                content_type: self.content_type,
                schema_version: self.schema_version,
                encoding: self.encoding,
                priority: self.priority,
                ttl_ms: self
                    .ttl
                    .map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)),
                retry_count: 0,
                properties: self.header_properties,
            },
            body,
        })
    }
}
