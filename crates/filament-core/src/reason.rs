//! Process death reasons.
//!
//! A [`DiedReason`] describes why a process stopped existing. It travels in
//! monitor notifications and drives link propagation, so the set is closed:
//! every consumer can match exhaustively.

use crate::ProcessId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The reason a process died.
///
/// # Normal vs abnormal
///
/// Only abnormal reasons propagate through links: a process linked to one
/// that died `Normal` is left alone, while any other reason terminates it
/// with [`DiedReason::LinkedDeath`]. Monitors report every death, whatever
/// the reason.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiedReason {
    /// The process ran to completion, or terminated itself.
    Normal,
    /// The process body returned an error or panicked.
    Exception(String),
    /// The connection to the process's node broke while a monitor or link
    /// on it was installed.
    Disconnected,
    /// A monitor or link was requested toward a process on a node already
    /// known to be unreachable.
    Unreachable,
    /// The process was terminated because a linked process died.
    LinkedDeath(ProcessId, Box<DiedReason>),
}

impl DiedReason {
    /// Returns `true` for [`DiedReason::Normal`].
    pub fn is_normal(&self) -> bool {
        matches!(self, DiedReason::Normal)
    }

    /// Returns `true` for every reason that propagates through links.
    #[inline]
    pub fn is_abnormal(&self) -> bool {
        !self.is_normal()
    }

    /// Creates an [`DiedReason::Exception`] from any displayable error.
    pub fn exception(err: impl fmt::Display) -> Self {
        DiedReason::Exception(err.to_string())
    }
}

impl fmt::Display for DiedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiedReason::Normal => write!(f, "normal"),
            DiedReason::Exception(msg) => write!(f, "exception: {}", msg),
            DiedReason::Disconnected => write!(f, "disconnected"),
            DiedReason::Unreachable => write!(f, "unreachable"),
            DiedReason::LinkedDeath(pid, reason) => {
                write!(f, "linked death: {} died ({})", pid, reason)
            }
        }
    }
}
