//! Recovery points: named stages of a resumable handler.
//!
//! Every record starts at [`RecoveryPoint::STARTED`] and ends at
//! [`RecoveryPoint::FINISHED`]. Endpoints that need to persist partial
//! progress declare their own intermediate points:
//!
//! ```
//! use idempotency_core::RecoveryPoint;
//!
//! const CHARGE_CREATED: RecoveryPoint = RecoveryPoint::custom("charge_created");
//!
//! assert!(RecoveryPoint::STARTED.is_started());
//! assert!(!CHARGE_CREATED.is_finished());
//! assert_eq!(CHARGE_CREATED.as_str(), "charge_created");
//! ```

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Maximum length of a recovery point name (matches the storage column width).
pub const MAX_RECOVERY_POINT_LEN: usize = 64;

/// Errors raised when parsing a recovery point name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoveryPointError {
    /// The name was empty.
    #[error("Recovery point name must not be empty")]
    Empty,

    /// The name exceeded [`MAX_RECOVERY_POINT_LEN`] bytes.
    #[error("Recovery point name is {0} bytes long, maximum is {MAX_RECOVERY_POINT_LEN}")]
    TooLong(usize),
}

/// Identifier of a stage in a multi-step handler.
///
/// Stored as plain text, so custom points survive process restarts as long as
/// the handler's stage map still knows them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecoveryPoint(Cow<'static, str>);

impl RecoveryPoint {
    /// Initial recovery point of every record.
    pub const STARTED: Self = Self(Cow::Borrowed("started"));

    /// Terminal recovery point; the record carries its cached response.
    pub const FINISHED: Self = Self(Cow::Borrowed("finished"));

    /// Declare a custom intermediate recovery point.
    ///
    /// The name must be at most [`MAX_RECOVERY_POINT_LEN`] bytes and must not
    /// collide with `started` or `finished`.
    #[must_use]
    pub const fn custom(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Parse a recovery point read back from storage.
    ///
    /// # Errors
    ///
    /// Returns [`RecoveryPointError`] if the name is empty or too long.
    pub fn parse(name: impl Into<String>) -> Result<Self, RecoveryPointError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RecoveryPointError::Empty);
        }
        if name.len() > MAX_RECOVERY_POINT_LEN {
            return Err(RecoveryPointError::TooLong(name.len()));
        }

        Ok(match name.as_str() {
            "started" => Self::STARTED,
            "finished" => Self::FINISHED,
            _ => Self(Cow::Owned(name)),
        })
    }

    /// The stored name of this recovery point.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the initial recovery point.
    #[must_use]
    pub fn is_started(&self) -> bool {
        *self == Self::STARTED
    }

    /// Whether this is the terminal recovery point.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        *self == Self::FINISHED
    }
}

impl Default for RecoveryPoint {
    fn default() -> Self {
        Self::STARTED
    }
}

impl fmt::Display for RecoveryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
