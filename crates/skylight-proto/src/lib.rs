//! Shared protocol definitions for the Skylight broker and its endpoints.
//! Session/permission vocabulary plus the relay wire schema live here so
//! client bindings can be regenerated without pulling in the server.

mod control;
mod relay;

pub use control::{ControlEvent, ControlEventError, InputClass, MouseButton};
pub use relay::{ClientMessage, PeerInfo, PeerRole, ServerMessage};

use serde::{Deserialize, Serialize};

/// How a session came to exist: token-shared and time-bounded, or standing
/// access consuming a trust grant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Instant,
    Permanent,
}

impl SessionKind {
    /// Type tag prefixed onto session capability tokens.
    pub fn token_prefix(&self) -> &'static str {
        match self {
            SessionKind::Instant => "inst",
            SessionKind::Permanent => "perm",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Active,
    Ended,
    Expired,
}

impl SessionStatus {
    /// Terminal states are one-way; `ended` and `expired` differ only for
    /// reporting.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Ended | SessionStatus::Expired)
    }
}

/// What the controller side of a session is allowed to do. Fixed at
/// creation and immutable for the session's lifetime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Permissions {
    pub view_only: bool,
    pub mouse_control: bool,
    pub keyboard_control: bool,
}

impl Default for Permissions {
    fn default() -> Self {
        Self {
            view_only: false,
            mouse_control: true,
            keyboard_control: true,
        }
    }
}

impl Permissions {
    /// Whether an input event of the given class may be relayed under
    /// these permissions. View-only wins over everything.
    pub fn allows(&self, class: InputClass) -> bool {
        if self.view_only {
            return false;
        }
        match class {
            InputClass::Pointer => self.mouse_control,
            InputClass::Keyboard => self.keyboard_control,
        }
    }
}

/// Permission template carried by a trust grant: the session permissions
/// plus whether a consuming session activates without owner approval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct GrantPermissions {
    pub auto_approve: bool,
    pub view_only: bool,
    pub mouse_control: bool,
    pub keyboard_control: bool,
}

impl Default for GrantPermissions {
    fn default() -> Self {
        Self {
            auto_approve: false,
            view_only: false,
            mouse_control: true,
            keyboard_control: true,
        }
    }
}

impl GrantPermissions {
    /// The session permission set copied onto sessions consuming the grant.
    pub fn session_permissions(&self) -> Permissions {
        Permissions {
            view_only: self.view_only,
            mouse_control: self.mouse_control,
            keyboard_control: self.keyboard_control,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_defaults_allow_full_control() {
        let perms = Permissions::default();
        assert!(perms.allows(InputClass::Pointer));
        assert!(perms.allows(InputClass::Keyboard));
    }

    #[test]
    fn view_only_blocks_all_input() {
        let perms = Permissions {
            view_only: true,
            mouse_control: true,
            keyboard_control: true,
        };
        assert!(!perms.allows(InputClass::Pointer));
        assert!(!perms.allows(InputClass::Keyboard));
    }

    #[test]
    fn capability_flags_are_independent() {
        let perms = Permissions {
            view_only: false,
            mouse_control: false,
            keyboard_control: true,
        };
        assert!(!perms.allows(InputClass::Pointer));
        assert!(perms.allows(InputClass::Keyboard));
    }

    #[test]
    fn grant_template_maps_onto_session_permissions() {
        let grant = GrantPermissions {
            auto_approve: true,
            view_only: true,
            mouse_control: false,
            keyboard_control: false,
        };
        let perms = grant.session_permissions();
        assert!(perms.view_only);
        assert!(!perms.mouse_control);
    }

    #[test]
    fn permissions_accept_partial_json() {
        let perms: Permissions = serde_json::from_str(r#"{"viewOnly":true}"#).unwrap();
        assert!(perms.view_only);
        assert!(perms.mouse_control);

        let grant: GrantPermissions = serde_json::from_str(r#"{"autoApprove":true}"#).unwrap();
        assert!(grant.auto_approve);
        assert!(grant.keyboard_control);
    }
}
