//! Common identifiers and status enums shared across engram crates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generic artifact identifier type
pub type Id = Uuid;

/// Organization (tenant) identifier, resolved from the API key
pub type OrgId = String;

/// Client-assigned user identifier
pub type UserId = String;

/// Client- or server-assigned request identifier
pub type RequestId = String;

/// Tenant-monotone interaction sequence number
pub type InteractionId = i64;

/// Visibility status of derived artifacts
///
/// `Current` rows are returned by default reads, `Pending` rows come from
/// rerun batches awaiting promotion, `Archived` rows are superseded history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Current,
    Pending,
    Archived,
}

impl ArtifactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Current => "current",
            ArtifactStatus::Pending => "pending",
            ArtifactStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "current" => Some(ArtifactStatus::Current),
            "pending" => Some(ArtifactStatus::Pending),
            "archived" => Some(ArtifactStatus::Archived),
            _ => None,
        }
    }
}

/// Review state of an aggregated feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Approved => "approved",
            ReviewStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReviewStatus::Pending),
            "approved" => Some(ReviewStatus::Approved),
            "rejected" => Some(ReviewStatus::Rejected),
            _ => None,
        }
    }
}

/// Lifecycle state of a synthesized skill
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillStatus {
    Draft,
    Active,
    Retired,
}

impl SkillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillStatus::Draft => "draft",
            SkillStatus::Active => "active",
            SkillStatus::Retired => "retired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(SkillStatus::Draft),
            "active" => Some(SkillStatus::Active),
            "retired" => Some(SkillStatus::Retired),
            _ => None,
        }
    }
}

/// Speaker role of an interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Agent,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Agent => "Agent",
            Role::System => "System",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "User" => Some(Role::User),
            "Agent" => Some(Role::Agent),
            "System" => Some(Role::System),
            _ => None,
        }
    }
}

/// UI action the user took alongside an interaction, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserAction {
    None,
    Click,
    Scroll,
    Type,
}

impl Default for UserAction {
    fn default() -> Self {
        UserAction::None
    }
}

impl UserAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserAction::None => "NONE",
            UserAction::Click => "CLICK",
            UserAction::Scroll => "SCROLL",
            UserAction::Type => "TYPE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NONE" => Some(UserAction::None),
            "CLICK" => Some(UserAction::Click),
            "SCROLL" => Some(UserAction::Scroll),
            "TYPE" => Some(UserAction::Type),
            _ => None,
        }
    }
}

/// Embedding dimensionality used across all semantic columns
pub const EMBEDDING_DIM: usize = 512;

/// Helper functions
pub fn new_id() -> Id {
    Uuid::new_v4()
}

pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

pub fn default_true() -> bool {
    true
}

/// Normalize a client-supplied request group: `None` and `""` both mean
/// ungrouped
pub fn normalize_request_group(group: Option<String>) -> Option<String> {
    group.filter(|g| !g.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            ArtifactStatus::Current,
            ArtifactStatus::Pending,
            ArtifactStatus::Archived,
        ] {
            assert_eq!(ArtifactStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ArtifactStatus::parse("deleted"), None);
    }

    #[test]
    fn test_request_group_normalization() {
        assert_eq!(normalize_request_group(None), None);
        assert_eq!(normalize_request_group(Some(String::new())), None);
        assert_eq!(
            normalize_request_group(Some("thread-1".to_string())),
            Some("thread-1".to_string())
        );
    }
}
