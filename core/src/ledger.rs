//! Status ledger types.
//!
//! Every submission gets exactly one ledger entry before its envelope is
//! published. The entry starts `pending` and moves once, to `processed` or to
//! `error`. The processed timestamp is set exactly when the status leaves
//! `pending`.

use crate::store::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Default page size for ledger listings.
pub const DEFAULT_PAGE_LIMIT: i64 = 50;

/// Largest page size a ledger listing will return.
pub const MAX_PAGE_LIMIT: i64 = 100;

/// Identifier of a ledger entry, also used as the envelope correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerId(i64);

impl LedgerId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// The raw identifier.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for LedgerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for LedgerId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Processing status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    /// Accepted, waiting for the consumer
    Pending,
    /// Applied by the consumer
    Processed,
    /// Given up on after bounded retry
    Error,
}

impl LedgerStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 3] = [Self::Pending, Self::Processed, Self::Error];

    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Error => "error",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Decode`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processed" => Ok(Self::Processed),
            "error" => Ok(Self::Error),
            _ => Err(StoreError::Decode(format!("Invalid ledger status: {s}"))),
        }
    }

    /// Whether the entry has left `pending`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Only `pending → processed` and `pending → error` are allowed.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processed | Self::Error)
        )
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the status ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Identifier assigned on create
    pub id: LedgerId,
    /// Flight identifier of the submission
    pub flight_number: String,
    /// Scheduled departure of the submission
    pub departure_date: DateTime<Utc>,
    /// Current status
    pub status: LedgerStatus,
    /// When the entry was created
    pub created_at: DateTime<Utc>,
    /// When the entry left `pending`
    pub processed_at: Option<DateTime<Utc>>,
}

/// Filter for listing ledger entries of one flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerQuery {
    /// Flight identifier to list
    pub flight_number: String,
    /// Only entries in this status, if set
    pub status: Option<LedgerStatus>,
    /// Page size, already clamped with [`LedgerQuery::clamp_limit`]
    pub limit: i64,
}

impl LedgerQuery {
    /// Build a query, clamping the requested page size.
    #[must_use]
    pub fn new(
        flight_number: impl Into<String>,
        status: Option<LedgerStatus>,
        limit: Option<i64>,
    ) -> Self {
        Self {
            flight_number: flight_number.into(),
            status,
            limit: Self::clamp_limit(limit),
        }
    }

    /// Out-of-range or missing limits fall back to [`DEFAULT_PAGE_LIMIT`].
    #[must_use]
    pub const fn clamp_limit(limit: Option<i64>) -> i64 {
        match limit {
            Some(limit) if limit > 0 && limit <= MAX_PAGE_LIMIT => limit,
            _ => DEFAULT_PAGE_LIMIT,
        }
    }
}

/// One page of ledger entries plus the unpaginated total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerPage {
    /// Flight identifier that was listed
    pub flight_number: String,
    /// Entries, newest first
    pub entries: Vec<LedgerEntry>,
    /// Number of matching entries ignoring the limit
    pub total: i64,
    /// Page size used
    pub limit: i64,
}

/// Number of ledger entries per status.
pub type StatusCounts = BTreeMap<LedgerStatus, i64>;
