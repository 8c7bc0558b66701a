use crate::{error::Result, model::EventPayload};

pub struct Codec;

impl super::Codec for Codec {
    fn get_name(&self) -> String {
        String::from("json")
    }
    fn encode(&self, payload: &EventPayload) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(payload)?)
    }
    fn decode(&self, message: &[u8]) -> Result<EventPayload> {
        Ok(serde_json::from_slice(message)?)
    }
}
