//! Manages payload codecs
pub mod avro;
pub mod json;

use std::sync::Arc;

use crate::{
    error::{RelayError, Result},
    model::EventPayload,
};

/// Confluent [header](https://docs.confluent.io/platform/current/schema-registry/fundamentals/serdes-develop/index.html#wire-format) length
pub const CONFLUENT_HEADER_LEN: usize = 5;

/// Codec converts change event payloads to and from channel bytes
pub trait Codec {
    fn get_name(&self) -> String;
    fn encode(&self, payload: &EventPayload) -> Result<Vec<u8>>;
    fn decode(&self, message: &[u8]) -> Result<EventPayload>;
}

/// Creates codec of specified name.
/// If you add your own codecs, register them here
pub fn get_codec(
    name: &str,
    codec_settings: Option<toml::Value>,
) -> Result<Arc<dyn Codec + Send + Sync>> {
    match name {
        "json" => Ok(Arc::new(json::Codec {})),
        "avro" => {
            let settings = match codec_settings {
                Some(s) => s
                    .try_into()
                    .map_err(|e| RelayError::Config(format!("avro codec settings: {e}")))?,
                None => avro::Settings::default(),
            };
            Ok(Arc::new(avro::new(settings)?))
        }
        _ => Err(RelayError::Config(format!("unknown codec {}", name))),
    }
}
