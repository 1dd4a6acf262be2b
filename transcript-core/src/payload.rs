//! Payload type tags and the decoder registry
//!
//! Every event stored in a transcript carries a string tag naming the type of
//! its payload. Producers implement [`EventPayload`] for the types they
//! record, and readers register the same types to get a decoder per tag.
//!
//! # Example
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use transcript_core::payload::{EventPayload, PayloadRegistry};
//!
//! #[derive(Serialize, Deserialize)]
//! struct NodeStarted {
//!     name: String,
//! }
//!
//! impl EventPayload for NodeStarted {
//!     const TYPE_TAG: &'static str = "NodeStarted";
//! }
//!
//! let mut registry = PayloadRegistry::new();
//! registry.register::<NodeStarted>().unwrap();
//! let decoded = registry.decode("NodeStarted", r#"{"name":"codex-1"}"#).unwrap();
//! assert_eq!(decoded.downcast_ref::<NodeStarted>().unwrap().name, "codex-1");
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::{Any, TypeId};
use std::collections::HashMap;

use crate::error::{Result, TranscriptError};

/// A value that can be recorded as an event payload
pub trait EventPayload: Serialize + DeserializeOwned + Send + 'static {
    /// Stable tag written next to the payload in the archive
    const TYPE_TAG: &'static str;
}

impl EventPayload for String {
    const TYPE_TAG: &'static str = "String";
}

impl EventPayload for serde_json::Value {
    const TYPE_TAG: &'static str = "Value";
}

/// Encode a payload to its stored JSON string
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// A decoded payload, downcast by the handler that registered its type
pub type DecodedPayload = Box<dyn Any + Send>;

type DecodeFn = fn(&str) -> serde_json::Result<DecodedPayload>;

fn decode_as<T: EventPayload>(payload: &str) -> serde_json::Result<DecodedPayload> {
    let value: T = serde_json::from_str(payload)?;
    Ok(Box::new(value))
}

/// Mapping from type tag to a decoder for one concrete type
#[derive(Default)]
pub struct PayloadRegistry {
    decoders: HashMap<&'static str, (TypeId, DecodeFn)>,
}

impl PayloadRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under its type tag. Registering the same type twice is a no-op.
    ///
    /// # Errors
    ///
    /// `Validation` if the tag is already bound to a different type.
    pub fn register<T: EventPayload>(&mut self) -> Result<()> {
        let type_id = TypeId::of::<T>();
        let (bound, _) = *self
            .decoders
            .entry(T::TYPE_TAG)
            .or_insert((type_id, decode_as::<T>));
        if bound != type_id {
            return Err(TranscriptError::Validation(format!(
                "type tag '{}' is already registered for another type than {}",
                T::TYPE_TAG,
                std::any::type_name::<T>()
            )));
        }
        Ok(())
    }

    /// Whether a decoder exists for the tag
    pub fn contains(&self, type_tag: &str) -> bool {
        self.decoders.contains_key(type_tag)
    }

    /// Registered tags
    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    /// Decode a stored payload with the decoder registered for `type_tag`
    pub fn decode(&self, type_tag: &str, payload: &str) -> Result<DecodedPayload> {
        let (_, decode) = self.decoders.get(type_tag).ok_or_else(|| {
            TranscriptError::Validation(format!("no decoder registered for type '{}'", type_tag))
        })?;
        decode(payload).map_err(|e| {
            TranscriptError::Format(format!("payload of type '{}' does not decode: {}", type_tag, e))
        })
    }
}

impl std::fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.decoders.keys().collect();
        tags.sort();
        f.debug_struct("PayloadRegistry").field("tags", &tags).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct DialAttempt {
        peer: String,
        success: bool,
    }

    impl EventPayload for DialAttempt {
        const TYPE_TAG: &'static str = "DialAttempt";
    }

    #[test]
    fn test_register_and_decode() {
        let mut registry = PayloadRegistry::new();
        registry.register::<DialAttempt>().unwrap();
        registry.register::<String>().unwrap();

        let payload = encode(&DialAttempt {
            peer: "node-2".to_string(),
            success: true,
        })
        .unwrap();

        let decoded = registry.decode("DialAttempt", &payload).unwrap();
        let dial = decoded.downcast_ref::<DialAttempt>().unwrap();
        assert_eq!(dial.peer, "node-2");
        assert!(dial.success);

        let text = registry.decode("String", "\"90\"").unwrap();
        assert_eq!(text.downcast_ref::<String>().unwrap(), "90");
    }

    #[test]
    fn test_unknown_tag_and_bad_payload() {
        let mut registry = PayloadRegistry::new();
        registry.register::<DialAttempt>().unwrap();

        let err = registry.decode("Missing", "{}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = registry.decode("DialAttempt", "{\"peer\":1}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_duplicate_registration_is_noop() {
        let mut registry = PayloadRegistry::new();
        registry.register::<String>().unwrap();
        registry.register::<String>().unwrap();
        assert_eq!(registry.tags().count(), 1);
        assert!(registry.contains("String"));
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Impostor {
        x: u32,
    }

    impl EventPayload for Impostor {
        const TYPE_TAG: &'static str = "String";
    }

    #[test]
    fn test_tag_bound_to_another_type_rejected() {
        let mut registry = PayloadRegistry::new();
        registry.register::<String>().unwrap();

        let err = registry.register::<Impostor>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        // the original binding stays intact
        let text = registry.decode("String", "\"kept\"").unwrap();
        assert_eq!(text.downcast_ref::<String>().unwrap(), "kept");
    }
}
