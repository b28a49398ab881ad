// src/domain/identity.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::Topic;
use crate::{NotifyError, Result};

/// Broadcast destination every STOMP client listens on.
pub const BROADCAST_TOPIC: &str = "/topic/notifications";

/// The authenticated dashboard user notifications are delivered to.
///
/// Residents are identified by email, prestataires by their NEQ, and the
/// public-works office shares the single identifier `stpm`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserIdentity {
    Resident { email: String },
    Prestataire { neq: String },
    Stpm,
}

impl UserIdentity {
    // ---
    pub fn resident(email: impl Into<String>) -> Self {
        UserIdentity::Resident {
            email: email.into(),
        }
    }

    pub fn prestataire(neq: impl Into<String>) -> Self {
        UserIdentity::Prestataire { neq: neq.into() }
    }

    /// Identifier used in per-user endpoints and topics.
    pub fn identifier(&self) -> &str {
        match self {
            UserIdentity::Resident { email } => email,
            UserIdentity::Prestataire { neq } => neq,
            UserIdentity::Stpm => "stpm",
        }
    }

    /// Name of the role-wide notification group.
    pub fn group(&self) -> &'static str {
        match self {
            UserIdentity::Resident { .. } => "residents",
            UserIdentity::Prestataire { .. } => "prestataires",
            UserIdentity::Stpm => "stpm",
        }
    }

    /// Broker destinations this user receives notifications on: broadcast,
    /// role group, then the personal topic (deduplicated).
    pub fn destinations(&self) -> Vec<Topic> {
        // ---
        let mut topics = vec![
            Topic::from(BROADCAST_TOPIC),
            Topic::from(format!("{BROADCAST_TOPIC}/{}", self.group())),
        ];

        let personal = Topic::from(format!("{BROADCAST_TOPIC}/{}", self.identifier()));
        if !topics.contains(&personal) {
            topics.push(personal);
        }
        topics
    }

    /// Build an identity from a role name and an identifier.
    ///
    /// Roles are matched case-insensitively: `resident`, `prestataire`, `stpm`.
    /// The identifier is ignored for `stpm`.
    pub fn from_role(role: &str, id: Option<&str>) -> Result<Self> {
        // ---
        let id = id.map(str::trim).filter(|s| !s.is_empty());

        match (role.trim().to_ascii_lowercase().as_str(), id) {
            ("stpm", _) => Ok(UserIdentity::Stpm),
            ("resident", Some(email)) => Ok(UserIdentity::resident(email)),
            ("prestataire", Some(neq)) => Ok(UserIdentity::prestataire(neq)),
            ("resident" | "prestataire", None) => Err(NotifyError::InvalidConfig(format!(
                "role {role} requires a user identifier"
            ))),
            (other, _) => Err(NotifyError::InvalidConfig(format!(
                "unknown user role: {other}"
            ))),
        }
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group(), self.identifier())
    }
}

impl FromStr for UserIdentity {
    type Err = NotifyError;

    /// Parse `role:identifier` (or just `stpm`).
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((role, id)) => Self::from_role(role, Some(id)),
            None => Self::from_role(s, None),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_resident_destinations() {
        // ---
        let who = UserIdentity::resident("marie@test.com");

        assert_eq!(who.identifier(), "marie@test.com");
        assert_eq!(
            who.destinations(),
            vec![
                Topic::from("/topic/notifications"),
                Topic::from("/topic/notifications/residents"),
                Topic::from("/topic/notifications/marie@test.com"),
            ]
        );
    }

    #[test]
    fn test_stpm_destinations_are_deduplicated() {
        // ---
        let destinations = UserIdentity::Stpm.destinations();
        assert_eq!(destinations.len(), 2);
        assert_eq!(destinations[1], Topic::from("/topic/notifications/stpm"));
    }

    #[test]
    fn test_parse_roles() {
        // ---
        assert_eq!(
            "prestataire:1234567890".parse::<UserIdentity>().unwrap(),
            UserIdentity::prestataire("1234567890")
        );
        assert_eq!("STPM".parse::<UserIdentity>().unwrap(), UserIdentity::Stpm);
        assert!("resident".parse::<UserIdentity>().is_err());
        assert!("maire:bob".parse::<UserIdentity>().is_err());
    }

    #[test]
    fn test_serde_tagging() {
        // ---
        let json = serde_json::to_value(UserIdentity::resident("a@b.c")).unwrap();
        assert_eq!(json["type"], "RESIDENT");
        assert_eq!(json["email"], "a@b.c");
    }
}
