//! Sensor readings and their wire representation
//!
//! A [`Message`] is produced by a sensor at every sampling tick, serialized
//! once by the producer handle and decoded once by the ingestion loop. It is
//! never mutated after construction.
//!
//! # Wire format
//!
//! A flat JSON object, identical for every transport:
//!
//! ```text
//! {"id":0,"name":"Load","data":2.5,"timestamp":"2024-05-01_12:00:00:000001"}
//! ```
//!
//! `data: null` encodes [`Payload::EndOfStream`], the sentinel a producer
//! sends before closing its channel. All four keys are required; unknown keys
//! are ignored.

use crate::error::{FleetError, Result};
use chrono::{Local, NaiveDateTime, SubsecRound};
use serde::{Deserialize, Deserializer, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Timestamp layout: local time with microsecond resolution.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H:%M:%S:%6f";

/// Content of a message: a reading or the end-of-stream marker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    /// A sampled value
    Reading(f64),
    /// The producer is done; nothing follows on this channel
    EndOfStream,
}

impl Payload {
    /// The reading, if any
    pub fn value(&self) -> Option<f64> {
        match self {
            Payload::Reading(v) => Some(*v),
            Payload::EndOfStream => None,
        }
    }
}

/// Immutable data record produced by a sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: i64,
    name: String,
    payload: Payload,
    timestamp: String,
}

#[derive(Serialize, Deserialize)]
struct WireMessage<'a> {
    id: i64,
    #[serde(borrow)]
    name: Cow<'a, str>,
    #[serde(deserialize_with = "required_nullable")]
    data: Option<f64>,
    #[serde(borrow)]
    timestamp: Cow<'a, str>,
}

// `deserialize_with` turns off serde's implicit "missing Option means None",
// so a truncated object cannot masquerade as the sentinel.
fn required_nullable<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<f64>::deserialize(deserializer)
}

impl Message {
    /// Create a reading
    pub fn reading(id: i64, name: impl Into<String>, value: f64, timestamp: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            payload: Payload::Reading(value),
            timestamp: timestamp.into(),
        }
    }

    /// Create the end-of-stream sentinel
    pub fn end_of_stream(id: i64, name: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            payload: Payload::EndOfStream,
            timestamp: timestamp.into(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> Payload {
        self.payload
    }

    /// The reading, `None` for the sentinel
    pub fn data(&self) -> Option<f64> {
        self.payload.value()
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// True for the end-of-stream sentinel
    pub fn is_end_of_stream(&self) -> bool {
        self.payload == Payload::EndOfStream
    }

    /// Parse the timestamp back into a date-time, if it follows [`TIMESTAMP_FORMAT`]
    pub fn parsed_timestamp(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.timestamp, TIMESTAMP_FORMAT).ok()
    }

    /// Encode into the wire representation.
    ///
    /// Non-finite readings are rejected: JSON has no encoding for them and a
    /// NaN would otherwise decode as the sentinel.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        if let Payload::Reading(v) = self.payload {
            if !v.is_finite() {
                return Err(FleetError::Serialization(format!(
                    "non-finite reading {} from sensor {}",
                    v, self.name
                )));
            }
        }

        let wire = WireMessage {
            id: self.id,
            name: Cow::Borrowed(&self.name),
            data: self.payload.value(),
            timestamp: Cow::Borrowed(&self.timestamp),
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Decode from the wire representation.
    ///
    /// Truncated or non-conforming input is a [`FleetError::MalformedMessage`];
    /// callers skip the message and keep reading.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let wire: WireMessage<'_> = serde_json::from_slice(bytes)
            .map_err(|e| FleetError::MalformedMessage(e.to_string()))?;

        let payload = match wire.data {
            Some(v) => Payload::Reading(v),
            None => Payload::EndOfStream,
        };

        Ok(Self {
            id: wire.id,
            name: wire.name.into_owned(),
            payload,
            timestamp: wire.timestamp.into_owned(),
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.payload {
            Payload::Reading(v) => write!(f, "{}\t{}\t{}\t{}", self.id, self.name, v, self.timestamp),
            Payload::EndOfStream => write!(f, "{}\t{}\t<end>\t{}", self.id, self.name, self.timestamp),
        }
    }
}

/// Per-sensor source of strictly increasing timestamps.
///
/// The wall clock is truncated to microseconds; when it has not advanced past
/// the previous stamp the previous stamp plus one microsecond is used.
#[derive(Debug, Default, Clone)]
pub struct TimestampClock {
    last: Option<NaiveDateTime>,
}

impl TimestampClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp, formatted with [`TIMESTAMP_FORMAT`]
    pub fn now(&mut self) -> String {
        self.next_after(Local::now().naive_local())
    }

    fn next_after(&mut self, wall: NaiveDateTime) -> String {
        let mut stamp = wall.trunc_subsecs(6);
        if let Some(last) = self.last {
            if stamp <= last {
                stamp = last + chrono::Duration::microseconds(1);
            }
        }
        self.last = Some(stamp);
        stamp.format(TIMESTAMP_FORMAT).to_string()
    }
}
