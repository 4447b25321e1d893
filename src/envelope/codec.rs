//! Envelope codecs.
//!
//! Only the header and the body's schema reference, raw payload, validation
//! state and properties are encoded. Both codecs round-trip the raw payload
//! byte for byte.

use super::Envelope;
use crate::types::Result;

/// Pluggable envelope wire/storage format.
pub trait EnvelopeCodec: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<Envelope>;
}

/// Text codec (JSON).
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl EnvelopeCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(envelope)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Compact binary codec (MessagePack with named fields).
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackCodec;

impl EnvelopeCodec for MsgPackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(envelope)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ParserRegistry, Priority, CONTENT_TYPE_OCTET_STREAM};
    use crate::types::Error;
    use bytes::Bytes;
    use proptest::prelude::*;

    fn codecs() -> [Box<dyn EnvelopeCodec>; 2] {
        [Box::new(JsonCodec), Box::new(MsgPackCodec)]
    }

    proptest! {
        #[test]
        fn raw_payload_survives_every_codec(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
            let parsers = ParserRegistry::with_builtins();
            let env = Envelope::create(
                &parsers,
                CONTENT_TYPE_OCTET_STREAM,
                Bytes::from(payload.clone()),
                "1",
                "a",
                "b",
                Priority::HIGHEST,
            )
            .unwrap();
            env.validate(&parsers).unwrap();

            for codec in codecs() {
                let back = codec.decode(&codec.encode(&env).unwrap()).unwrap();
                prop_assert_eq!(back.raw_payload().as_ref(), payload.as_slice());
                prop_assert!(!back.body().is_parsed());
                prop_assert!(back.is_validated());
                prop_assert_eq!(&back, &env);
            }
        }
    }

    #[test]
    fn test_msgpack_is_smaller_than_json_for_binary() {
        let parsers = ParserRegistry::with_builtins();
        let env = Envelope::create(
            &parsers,
            CONTENT_TYPE_OCTET_STREAM,
            Bytes::from(vec![0xAB; 256]),
            "1",
            "a",
            "b",
            Priority::default(),
        )
        .unwrap();
        let json = JsonCodec.encode(&env).unwrap();
        let packed = MsgPackCodec.encode(&env).unwrap();
        assert!(packed.len() < json.len());
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(MsgPackCodec.decode(b"\xc1"), Err(Error::Codec(_))));
        assert!(matches!(JsonCodec.decode(b"{"), Err(Error::Serialization(_))));
    }
}
