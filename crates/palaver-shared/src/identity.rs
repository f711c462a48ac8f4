//! Resolved user identities.
//!
//! An [`Identity`] is produced by the token verification step at connection
//! or request time and lives only for that session; the core never persists
//! it. The [`IdentityKey`] (id, kind) pair is the key used by the connection
//! registry and the presence store -- admin and user id namespaces are
//! independent, so the id alone is not unique.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which verification authority namespace an identity belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UserKind {
    Admin,
    User,
}

impl UserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserKind::Admin => "admin",
            UserKind::User => "user",
        }
    }

    /// Parse the lowercase wire form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(UserKind::Admin),
            "user" => Some(UserKind::User),
            _ => None,
        }
    }
}

impl fmt::Display for UserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved, authenticated participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Upstream id, stringified (the authorities issue numeric ids).
    pub id: String,
    pub kind: UserKind,
    pub name: String,
    pub email: Option<String>,
    pub profile: Option<String>,
}

impl Identity {
    pub fn key(&self) -> IdentityKey {
        IdentityKey {
            user_id: self.id.clone(),
            kind: self.kind,
        }
    }
}

/// The (id, kind) pair identifying one participant across both namespaces.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub user_id: String,
    pub kind: UserKind,
}

impl IdentityKey {
    pub fn new(user_id: impl Into<String>, kind: UserKind) -> Self {
        Self {
            user_id: user_id.into(),
            kind,
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trip() {
        assert_eq!(UserKind::parse("admin"), Some(UserKind::Admin));
        assert_eq!(UserKind::parse("user"), Some(UserKind::User));
        assert_eq!(UserKind::parse("root"), None);
        assert_eq!(UserKind::Admin.as_str(), "admin");
    }

    #[test]
    fn key_distinguishes_kinds() {
        let admin = IdentityKey::new("7", UserKind::Admin);
        let user = IdentityKey::new("7", UserKind::User);
        assert_ne!(admin, user);
        assert_eq!(admin.to_string(), "7:admin");
    }
}
