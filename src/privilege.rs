//! Privilege gate: a root identity is structurally read-only.
//!
//! The gate runs before path evaluation for every mutating request, so a privileged caller
//! never reaches backup allocation regardless of how permissive the allowlist is.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::Identity;
use crate::policy::AccessMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeDenial {
    RootReadOnly,
}

impl fmt::Display for PrivilegeDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RootReadOnly => f.write_str(
                "running as root: all writes are disabled; re-run as a normal user to edit files",
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    Denied(PrivilegeDenial),
}

impl GateDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PrivilegeGate;

impl PrivilegeGate {
    pub fn check(identity: &Identity, requested: AccessMode) -> GateDecision {
        if identity.is_root() && requested.can_write() {
            tracing::debug!(
                uid = identity.uid(),
                mode = requested.as_str(),
                "privilege gate denied write for root identity"
            );
            return GateDecision::Denied(PrivilegeDenial::RootReadOnly);
        }
        GateDecision::Allowed
    }
}
