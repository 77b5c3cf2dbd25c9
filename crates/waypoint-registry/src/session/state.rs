//! Session lifecycle states.

use strum::{Display, IntoStaticStr};

/// Observable state of a registration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    /// Lease held and renewing.
    Healthy,
    /// Renewal failed; recovery in progress.
    Degraded,
    /// Recovery exhausted. The node is gone until the next install.
    Terminal,
    /// Uninstalled.
    Cancelled,
}

impl SessionState {
    /// Whether the heartbeat loop has stopped for good.
    pub fn is_final(self) -> bool {
        matches!(self, SessionState::Terminal | SessionState::Cancelled)
    }
}

/// Why `sustain_lease` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// The session was cancelled.
    Cancelled,
    /// Lease recovery failed `attempts` times in a row.
    Exhausted { attempts: u32 },
}

impl SessionExit {
    /// The matching error, for callers that want to propagate exhaustion.
    pub fn into_result(self) -> waypoint_core::Result<()> {
        match self {
            SessionExit::Cancelled => Ok(()),
            SessionExit::Exhausted { attempts } => {
                Err(waypoint_core::Error::ExhaustedRetry { attempts })
            }
        }
    }
}
