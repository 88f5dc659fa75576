//! RFC3339 timestamp wrapper shared by the registry and the TTL cache, so
//! both on-disk envelopes read as ISO strings instead of opaque epoch
//! floats, matching the original's plain timestamp-string fields.

use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(pub SystemTime);

impl Timestamp {
    pub fn now() -> Self {
        Timestamp(SystemTime::now())
    }

    pub fn epoch() -> Self {
        Timestamp(SystemTime::UNIX_EPOCH)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let dt: DateTime<Utc> = self.0.into();
        s.serialize_str(&dt.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        let dt = DateTime::parse_from_rfc3339(&raw).map_err(serde::de::Error::custom)?;
        Ok(Timestamp(dt.with_timezone(&Utc).into()))
    }
}
