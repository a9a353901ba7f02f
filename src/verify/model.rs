//! Values held in the two keyspaces of the verification store.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::code::Code;

/// Public metadata of the chat sender, captured when a code is claimed.
#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: i64,
    pub name: String,
    /// Fan badge shown next to the sender's name; empty when none.
    #[serde(default)]
    pub medal: String,
}

/// Value stored under a code. `Unclaimed -> Claimed` is the only transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeSlot {
    Unclaimed,
    Claimed(Identity),
}

/// Poll-able record stored under a session id.
///
/// `verified` is only ever true together with a claimant; the constructors are
/// the only way to build one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    verified: bool,
    code: Code,
    claimant: Option<Identity>,
}

impl Session {
    #[must_use]
    pub fn pending(code: Code) -> Self {
        Self {
            verified: false,
            code,
            claimant: None,
        }
    }

    #[must_use]
    pub fn resolved(code: Code, claimant: Identity) -> Self {
        Self {
            verified: true,
            code,
            claimant: Some(claimant),
        }
    }

    #[must_use]
    pub fn verified(&self) -> bool {
        self.verified
    }

    #[must_use]
    pub fn code(&self) -> &Code {
        &self.code
    }

    #[must_use]
    pub fn claimant(&self) -> Option<&Identity> {
        self.claimant.as_ref()
    }
}
