//! Transient connectivity classification
//!
//! A database failure is transient when its SQLSTATE says the session link is gone.
//! Those failures trigger reconnect-and-retry; every other failure is fatal for the
//! statement that raised it. All retry sites and [`Error::category`] consult this
//! module, so the policy lives in one place.

use crate::error::Error;

/// SQLSTATE codes that denote a severed or unusable session link.
///
/// - `08S01` communication link failure
/// - `08003` connection does not exist
/// - `08007` connection failure during transaction
/// - `HY010` function sequence error (driver state lost with the link)
pub const TRANSIENT_SQL_STATES: &[&str] = &["08S01", "08003", "08007", "HY010"];

/// Whether a SQLSTATE belongs to [`TRANSIENT_SQL_STATES`].
///
/// SQLSTATE values are compared case-insensitively; drivers disagree on `08s01`.
#[inline]
pub fn is_transient_state(sql_state: &str) -> bool {
    TRANSIENT_SQL_STATES
        .iter()
        .any(|state| state.eq_ignore_ascii_case(sql_state))
}

/// Whether `error` is a transient connectivity failure.
pub fn is_transient(error: &Error) -> bool {
    match error {
        Error::Driver {
            sql_state: Some(state),
            ..
        } => is_transient_state(state),
        _ => false,
    }
}
