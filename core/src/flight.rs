//! Flight submissions and the durable flight record.
//!
//! A [`SubmissionRequest`] is what the request layer binds from a client.
//! Once validated it becomes a [`FlightSubmission`], which is also the broker
//! payload. The consumer side turns a submission into a [`FlightRecord`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a submission is rejected before a ledger entry is created.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    /// The flight identifier was empty
    #[error("flight_number is required")]
    MissingFlightNumber,

    /// The scheduled departure was not supplied
    #[error("departure_date is required")]
    MissingDeparture,

    /// Passenger counts cannot be negative
    #[error("passengers_count must not be negative, got {0}")]
    NegativePassengers(i32),
}

/// Submission as bound from an inbound request.
///
/// Unknown fields are rejected. `departure_date` is optional here only so an
/// absent value can be reported as [`SubmissionError::MissingDeparture`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubmissionRequest {
    /// Aircraft type, free text (e.g. "A320")
    #[serde(default)]
    pub aircraft_type: String,
    /// Flight identifier (e.g. "AB123")
    #[serde(default)]
    pub flight_number: String,
    /// Scheduled departure
    #[serde(default)]
    pub departure_date: Option<DateTime<Utc>>,
    /// Scheduled arrival
    pub arrival_date: DateTime<Utc>,
    /// Number of passengers on board
    #[serde(default)]
    pub passengers_count: i32,
}

impl SubmissionRequest {
    /// Validate the request and turn it into a [`FlightSubmission`].
    ///
    /// # Errors
    ///
    /// Returns [`SubmissionError`] if the flight identifier is empty, the
    /// departure is unset or the passenger count is negative.
    pub fn into_submission(self) -> Result<FlightSubmission, SubmissionError> {
        let departure_date = self.departure_date.ok_or(SubmissionError::MissingDeparture)?;

        let submission = FlightSubmission {
            aircraft_type: self.aircraft_type,
            flight_number: self.flight_number,
            departure_date,
            arrival_date: self.arrival_date,
            passengers_count: self.passengers_count,
        };
        submission.validate()?;
        Ok(submission)
    }
}

/// Validated flight submission.
///
/// This is the broker message value. Field names are part of the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightSubmission {
    /// Aircraft type
    pub aircraft_type: String,
    /// Flight identifier
    pub flight_number: String,
    /// Scheduled departure
    pub departure_date: DateTime<Utc>,
    /// Scheduled arrival
    pub arrival_date: DateTime<Utc>,
    /// Number of passengers on board
    pub passengers_count: i32,
}

impl FlightSubmission {
    /// Check the invariants a submission must hold.
    ///
    /// # Errors
    ///
    /// Returns [`SubmissionError::MissingFlightNumber`] for a blank flight
    /// identifier and [`SubmissionError::NegativePassengers`] for a negative
    /// passenger count.
    pub fn validate(&self) -> Result<(), SubmissionError> {
        if self.flight_number.trim().is_empty() {
            return Err(SubmissionError::MissingFlightNumber);
        }
        if self.passengers_count < 0 {
            return Err(SubmissionError::NegativePassengers(self.passengers_count));
        }
        Ok(())
    }
}

/// Durable flight record, unique per `(flight_number, departure_date)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightRecord {
    /// Flight identifier (identity key, part 1)
    pub flight_number: String,
    /// Scheduled departure (identity key, part 2)
    pub departure_date: DateTime<Utc>,
    /// Aircraft type
    pub aircraft_type: String,
    /// Scheduled arrival
    pub arrival_date: DateTime<Utc>,
    /// Number of passengers on board
    pub passengers_count: i32,
    /// When this row was last written
    pub updated_at: DateTime<Utc>,
}

impl FlightRecord {
    /// Build the record an applied submission should leave behind.
    #[must_use]
    pub fn from_submission(submission: &FlightSubmission, updated_at: DateTime<Utc>) -> Self {
        Self {
            flight_number: submission.flight_number.clone(),
            departure_date: submission.departure_date,
            aircraft_type: submission.aircraft_type.clone(),
            arrival_date: submission.arrival_date,
            passengers_count: submission.passengers_count,
            updated_at,
        }
    }

    /// Identity key of this record.
    #[must_use]
    pub fn key(&self) -> (&str, DateTime<Utc>) {
        (&self.flight_number, self.departure_date)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn request_json(body: &str) -> Result<SubmissionRequest, serde_json::Error> {
        serde_json::from_str(body)
    }

    #[test]
    fn request_with_all_fields_becomes_submission() {
        let request = request_json(
            r#"{
                "aircraft_type": "A320",
                "flight_number": "AB123",
                "departure_date": "2025-06-01T10:00:00Z",
                "arrival_date": "2025-06-01T12:30:00Z",
                "passengers_count": 150
            }"#,
        )
        .expect("valid request");

        let submission = request.into_submission().expect("valid submission");
        assert_eq!(submission.flight_number, "AB123");
        assert_eq!(submission.passengers_count, 150);
        assert_eq!(submission.departure_date.to_rfc3339(), "2025-06-01T10:00:00+00:00");
    }

    #[test]
    fn missing_departure_is_rejected() {
        let request = request_json(
            r#"{"flight_number": "AB123", "arrival_date": "2025-06-01T12:30:00Z"}"#,
        )
        .expect("decodes without departure");

        assert_eq!(request.into_submission(), Err(SubmissionError::MissingDeparture));
    }

    #[test]
    fn empty_flight_number_is_rejected() {
        let request = request_json(
            r#"{
                "flight_number": "  ",
                "departure_date": "2025-06-01T10:00:00Z",
                "arrival_date": "2025-06-01T12:30:00Z"
            }"#,
        )
        .expect("decodes with blank flight number");

        assert_eq!(request.into_submission(), Err(SubmissionError::MissingFlightNumber));
    }

    #[test]
    fn unknown_fields_fail_to_decode() {
        let result = request_json(
            r#"{
                "flight_number": "AB123",
                "departure_date": "2025-06-01T10:00:00Z",
                "arrival_date": "2025-06-01T12:30:00Z",
                "gate": "B12"
            }"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn negative_passengers_are_rejected() {
        let submission = FlightSubmission {
            aircraft_type: "A320".to_string(),
            flight_number: "AB123".to_string(),
            departure_date: Utc::now(),
            arrival_date: Utc::now(),
            passengers_count: -1,
        };
        assert_eq!(submission.validate(), Err(SubmissionError::NegativePassengers(-1)));
    }
}
