//! `serde(with = ...)` helper storing `Vec<u8>` as a base64 string, the
//! same encoding the declarative store's generated clients use for byte
//! fields.

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    base64::engine::general_purpose::STANDARD.encode(bytes).serialize(s)
}

pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
    let raw = String::deserialize(de)?;
    base64::engine::general_purpose::STANDARD
        .decode(raw)
        .map_err(serde::de::Error::custom)
}
