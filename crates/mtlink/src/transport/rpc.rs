//! Remote-procedure-call error classification.
//!
//! The API reports failures as `(code, message)` pairs such as
//! `(303, "PHONE_MIGRATE_4")` or `(420, "FLOOD_WAIT_30")`. Only the pieces the
//! manager reacts to are interpreted here; the request/response schema itself
//! belongs to the transport.

use std::fmt;

use serde::{Deserialize, Serialize};

/// API layer the manager's collaborators are expected to speak.
pub const LAYER: i32 = 65;

const ERROR_SEE_OTHER: i32 = 303;
const ERROR_UNAUTHORIZED: i32 = 401;
const ERROR_FLOOD: i32 = 420;

const MIGRATE_MARKER: &str = "_MIGRATE_";
const FLOOD_WAIT_PREFIX: &str = "FLOOD_WAIT_";

/// Error returned by a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Redirect to another data center (`*_MIGRATE_<dc>`).
    pub fn is_see_other(&self) -> bool {
        self.code == ERROR_SEE_OTHER
    }

    /// The session holds no valid authorization.
    pub fn is_unauthorized(&self) -> bool {
        self.code == ERROR_UNAUTHORIZED
    }

    pub fn is_flood(&self) -> bool {
        self.code == ERROR_FLOOD
    }

    /// Data center named by a see-other error, e.g. `4` for `PHONE_MIGRATE_4`.
    pub fn migrate_dc(&self) -> Option<i32> {
        if !self.is_see_other() {
            return None;
        }
        let (_, dc) = self.message.split_once(MIGRATE_MARKER)?;
        dc.parse().ok()
    }

    /// Seconds to wait for a `FLOOD_WAIT_<n>` error.
    pub fn flood_wait_seconds(&self) -> Option<u32> {
        if !self.is_flood() {
            return None;
        }
        self.message.strip_prefix(FLOOD_WAIT_PREFIX)?.parse().ok()
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}
