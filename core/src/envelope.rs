//! Correlated message envelope and its broker encoding.
//!
//! On the wire an envelope is a Kafka record whose key is the decimal UTF-8
//! form of the ledger id and whose value is the JSON-encoded
//! [`FlightSubmission`]. Keying by correlation id keeps every message for one
//! ledger entry on one partition.

use crate::flight::FlightSubmission;
use crate::ledger::LedgerId;
use thiserror::Error;

/// Errors while encoding or decoding an envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The record carried no key
    #[error("Message key is missing")]
    MissingKey,

    /// The key was not a decimal ledger id
    #[error("Message key is not a ledger id: {0}")]
    InvalidKey(String),

    /// The record carried no value
    #[error("Message has no payload")]
    MissingPayload,

    /// The value was not a valid submission
    #[error("Failed to decode payload: {0}")]
    InvalidPayload(String),

    /// The submission could not be serialized
    #[error("Failed to encode payload: {0}")]
    Encode(String),
}

/// Correlation id plus payload, as handed to the outbound publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Ledger entry this message belongs to
    pub correlation_id: LedgerId,
    /// Submission data
    pub payload: FlightSubmission,
}

impl Envelope {
    /// Create an envelope.
    #[must_use]
    pub const fn new(correlation_id: LedgerId, payload: FlightSubmission) -> Self {
        Self {
            correlation_id,
            payload,
        }
    }

    /// Record key used for partitioning.
    #[must_use]
    pub fn routing_key(&self) -> String {
        self.correlation_id.to_string()
    }

    /// Serialize the payload into the record value.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Encode`] if JSON serialization fails.
    pub fn encode_value(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(&self.payload).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    /// Rebuild an envelope from a record's key and value.
    ///
    /// The value is decoded first, matching the order the consumer reports
    /// malformed messages in.
    ///
    /// # Errors
    ///
    /// Returns the first [`EnvelopeError`] found.
    pub fn decode(key: Option<&[u8]>, value: Option<&[u8]>) -> Result<Self, EnvelopeError> {
        let payload = decode_value(value)?;
        let correlation_id = decode_key(key)?;
        Ok(Self::new(correlation_id, payload))
    }
}

/// Parse a record key into a ledger id.
///
/// # Errors
///
/// Returns [`EnvelopeError::MissingKey`] or [`EnvelopeError::InvalidKey`].
pub fn decode_key(key: Option<&[u8]>) -> Result<LedgerId, EnvelopeError> {
    let key = key.ok_or(EnvelopeError::MissingKey)?;
    let text = std::str::from_utf8(key)
        .map_err(|_| EnvelopeError::InvalidKey(String::from_utf8_lossy(key).into_owned()))?;
    text.trim()
        .parse::<i64>()
        .map(LedgerId::new)
        .map_err(|_| EnvelopeError::InvalidKey(text.to_string()))
}

/// Parse a record value into a submission.
///
/// # Errors
///
/// Returns [`EnvelopeError::MissingPayload`] or [`EnvelopeError::InvalidPayload`].
pub fn decode_value(value: Option<&[u8]>) -> Result<FlightSubmission, EnvelopeError> {
    let value = value.ok_or(EnvelopeError::MissingPayload)?;
    serde_json::from_slice(value).map_err(|e| EnvelopeError::InvalidPayload(e.to_string()))
}

/// Partition a key lands on, given a fixed partition count.
///
/// Same hash as the Java client's default partitioner and librdkafka's
/// `murmur2_random`, which the producer is configured with, so this predicts
/// broker-side placement. Returns 0 when `partitions` is not positive.
#[must_use]
pub fn partition_for(key: &[u8], partitions: i32) -> i32 {
    if partitions <= 0 {
        return 0;
    }
    #[allow(clippy::cast_possible_wrap)] // masked to 31 bits
    let positive = (murmur2(key) & 0x7fff_ffff) as i32;
    positive % partitions
}

/// Kafka's 32-bit murmur2.
#[must_use]
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    #[allow(clippy::cast_possible_truncation)] // keys are far below 4 GiB
    let length = data.len() as u32;
    let mut h = SEED ^ length;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        if tail.len() >= 3 {
            h ^= u32::from(tail[2]) << 16;
        }
        if tail.len() >= 2 {
            h ^= u32::from(tail[1]) << 8;
        }
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn submission() -> FlightSubmission {
        FlightSubmission {
            aircraft_type: "A320".to_string(),
            flight_number: "AB123".to_string(),
            departure_date: Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap(),
            arrival_date: Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 0).unwrap(),
            passengers_count: 150,
        }
    }

    #[test]
    fn key_is_decimal_ledger_id() {
        let envelope = Envelope::new(LedgerId::new(42), submission());
        assert_eq!(envelope.routing_key(), "42");
        assert_eq!(decode_key(Some(b"42")), Ok(LedgerId::new(42)));
    }

    #[test]
    fn value_uses_wire_field_names() {
        let envelope = Envelope::new(LedgerId::new(1), submission());
        let value: serde_json::Value =
            serde_json::from_slice(&envelope.encode_value().unwrap()).unwrap();

        assert_eq!(value["flight_number"], "AB123");
        assert_eq!(value["aircraft_type"], "A320");
        assert_eq!(value["passengers_count"], 150);
        assert_eq!(value["departure_date"], "2025-06-01T10:00:00Z");
    }

    #[test]
    fn decode_reports_payload_before_key() {
        assert!(matches!(
            Envelope::decode(None, Some(b"not json")),
            Err(EnvelopeError::InvalidPayload(_))
        ));
        assert_eq!(Envelope::decode(Some(b"1"), None), Err(EnvelopeError::MissingPayload));

        let value = Envelope::new(LedgerId::new(7), submission()).encode_value().unwrap();
        assert_eq!(Envelope::decode(None, Some(&value)), Err(EnvelopeError::MissingKey));
        assert_eq!(
            Envelope::decode(Some(b"seven"), Some(&value)),
            Err(EnvelopeError::InvalidKey("seven".to_string()))
        );
        assert_eq!(
            Envelope::decode(Some(b"7"), Some(&value)),
            Ok(Envelope::new(LedgerId::new(7), submission()))
        );
    }

    #[test]
    fn murmur2_matches_java_client() {
        #[allow(clippy::cast_sign_loss)]
        let expected = |v: i32| v as u32;
        assert_eq!(murmur2(b"21"), expected(-973_932_308));
        assert_eq!(murmur2(b"foobar"), expected(-790_332_482));
    }

    #[test]
    fn non_positive_partition_count_maps_to_zero() {
        assert_eq!(partition_for(b"1", 0), 0);
        assert_eq!(partition_for(b"1", -3), 0);
    }

    proptest! {
        #[test]
        fn same_correlation_id_same_partition(id in any::<i64>(), partitions in 1..64i32) {
            let a = Envelope::new(LedgerId::new(id), submission());
            let mut other = submission();
            other.passengers_count = 3;
            let b = Envelope::new(LedgerId::new(id), other);

            let pa = partition_for(a.routing_key().as_bytes(), partitions);
            let pb = partition_for(b.routing_key().as_bytes(), partitions);
            prop_assert_eq!(pa, pb);
            prop_assert!((0..partitions).contains(&pa));
        }
    }
}
