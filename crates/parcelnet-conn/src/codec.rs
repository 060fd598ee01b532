//! Object serialization contract and the bundled JSON implementation.
//!
//! A codec instance is connection scoped: the acceptor hands each new
//! connection its own [`ObjectCodec::clone_codec`] copy. The codec's
//! [`ObjectCodec::method_id`] is stamped into every object header so that
//! peers using different serialization methods fail loudly.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A deserialized object as handed to listeners.
pub type Object = Box<dyn Any + Send>;

/// Errors raised by an [`ObjectCodec`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("type {0} is not registered")]
    Unregistered(String),

    #[error("unknown type tag '{0}'")]
    UnknownTag(String),

    #[error("type tag '{0}' is already registered")]
    DuplicateTag(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialization method contract used by a connection.
pub trait ObjectCodec: Send + Sync {
    /// Stable numeric id embedded in object headers.
    fn method_id(&self) -> u8;

    fn is_registered(&self, type_id: TypeId) -> bool;

    fn serialize(&self, object: &(dyn Any + Send)) -> Result<Vec<u8>, CodecError>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Object, CodecError>;

    /// Independent copy for a new connection.
    fn clone_codec(&self) -> Box<dyn ObjectCodec>;
}

type EncodeFn = fn(&(dyn Any + Send)) -> Result<serde_json::Value, CodecError>;
type DecodeFn = fn(serde_json::Value) -> Result<Object, CodecError>;

#[derive(Clone)]
struct Registration {
    tag: String,
    encode: EncodeFn,
    decode: DecodeFn,
}

#[derive(Clone, Default)]
struct Registry {
    by_type: HashMap<TypeId, Registration>,
    by_tag: HashMap<String, TypeId>,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    #[serde(rename = "type")]
    tag: &'a str,
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    tag: String,
    value: serde_json::Value,
}

/// JSON codec with name-tagged type registration.
///
/// Each object travels as `{"type": <tag>, "value": <json>}`.
#[derive(Default)]
pub struct JsonCodec {
    registry: RwLock<Registry>,
}

impl JsonCodec {
    pub const METHOD_ID: u8 = 1;

    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under a wire tag shared with the remote side.
    pub fn register<T>(&self, tag: &str) -> Result<(), CodecError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        if registry.by_tag.contains_key(tag) {
            return Err(CodecError::DuplicateTag(tag.to_string()));
        }
        registry.by_tag.insert(tag.to_string(), TypeId::of::<T>());
        registry.by_type.insert(
            TypeId::of::<T>(),
            Registration {
                tag: tag.to_string(),
                encode: encode_as::<T>,
                decode: decode_as::<T>,
            },
        );
        Ok(())
    }

    /// Builder form of [`JsonCodec::register`].
    pub fn with_type<T>(self, tag: &str) -> Result<Self, CodecError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.register::<T>(tag)?;
        Ok(self)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<String> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let mut tags: Vec<String> = registry.by_tag.keys().cloned().collect();
        tags.sort();
        tags
    }
}

impl ObjectCodec for JsonCodec {
    fn method_id(&self) -> u8 {
        Self::METHOD_ID
    }

    fn is_registered(&self, type_id: TypeId) -> bool {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_type
            .contains_key(&type_id)
    }

    fn serialize(&self, object: &(dyn Any + Send)) -> Result<Vec<u8>, CodecError> {
        let type_id = (*object).type_id();
        let registration = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_type
            .get(&type_id)
            .cloned()
            .ok_or_else(|| CodecError::Unregistered(format!("{type_id:?}")))?;

        let value = (registration.encode)(object)?;
        let envelope = EnvelopeRef {
            tag: &registration.tag,
            value,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Object, CodecError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        let decode = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            registry
                .by_tag
                .get(&envelope.tag)
                .and_then(|type_id| registry.by_type.get(type_id))
                .map(|registration| registration.decode)
                .ok_or_else(|| CodecError::UnknownTag(envelope.tag.clone()))?
        };
        decode(envelope.value)
    }

    fn clone_codec(&self) -> Box<dyn ObjectCodec> {
        let registry = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Box::new(JsonCodec {
            registry: RwLock::new(registry),
        })
    }
}

fn encode_as<T: Serialize + 'static>(
    object: &(dyn Any + Send),
) -> Result<serde_json::Value, CodecError> {
    let typed = object
        .downcast_ref::<T>()
        .ok_or_else(|| CodecError::Unregistered(type_name::<T>().to_string()))?;
    Ok(serde_json::to_value(typed)?)
}

fn decode_as<T: DeserializeOwned + Send + 'static>(
    value: serde_json::Value,
) -> Result<Object, CodecError> {
    let typed: T = serde_json::from_value(value)?;
    Ok(Box::new(typed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        text: String,
        count: u32,
    }

    fn codec() -> JsonCodec {
        JsonCodec::new().with_type::<Greeting>("greeting").unwrap()
    }

    #[test]
    fn serialize_deserialize_registered_type() {
        let codec = codec();
        let original = Greeting {
            text: "hi".into(),
            count: 3,
        };
        let bytes = codec.serialize(&original).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["type"], "greeting");
        assert_eq!(json["value"]["count"], 3);

        let object = codec.deserialize(&bytes).unwrap();
        assert_eq!(object.downcast_ref::<Greeting>(), Some(&original));
    }

    #[test]
    fn unregistered_type_rejected() {
        let codec = codec();
        assert!(!codec.is_registered(TypeId::of::<String>()));
        assert!(codec.is_registered(TypeId::of::<Greeting>()));
        assert!(matches!(
            codec.serialize(&"plain".to_string()),
            Err(CodecError::Unregistered(_))
        ));
    }

    #[test]
    fn unknown_tag_rejected() {
        let codec = codec();
        let bytes = br#"{"type":"other","value":1}"#;
        assert!(matches!(
            codec.deserialize(bytes),
            Err(CodecError::UnknownTag(tag)) if tag == "other"
        ));
    }

    #[test]
    fn duplicate_tag_rejected() {
        let codec = codec();
        assert!(matches!(
            codec.register::<u64>("greeting"),
            Err(CodecError::DuplicateTag(_))
        ));
    }

    #[test]
    fn clone_is_independent() {
        let codec = codec();
        let copy = codec.clone_codec();
        codec.register::<u64>("number").unwrap();
        assert!(codec.is_registered(TypeId::of::<u64>()));
        assert!(!copy.is_registered(TypeId::of::<u64>()));
        assert!(copy.is_registered(TypeId::of::<Greeting>()));
        assert_eq!(copy.method_id(), JsonCodec::METHOD_ID);
    }

    #[test]
    fn tags_are_sorted() {
        let codec = codec();
        codec.register::<u64>("alpha").unwrap();
        assert_eq!(codec.tags(), vec!["alpha".to_string(), "greeting".to_string()]);
    }
}
