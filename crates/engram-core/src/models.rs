//! Domain entities of the behavioral learning pipeline
//!
//! Every record is scoped to an `org_id` resolved from the caller's API key.
//! Text fields carrying semantic meaning also carry a 512-dimensional
//! embedding over the same content.

use chrono::{DateTime, Utc};
use engram_types::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// An ordered conversational turn-group
///
/// A request contains one or more interactions. `request_group` threads
/// related requests (a support conversation, a review thread); `None` means
/// ungrouped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub org_id: OrgId,
    pub request_id: RequestId,
    pub user_id: UserId,
    pub source: String,
    pub agent_version: String,
    pub request_group: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A tool invocation captured alongside an agent turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolUse {
    pub name: String,
    pub input: serde_json::Value,
}

/// One conversational turn inside a request
///
/// `interaction_id` strictly increases per tenant; once written, text fields
/// and `created_at` are immutable. `shadow_content` is an alternative agent
/// response captured alongside the production content for A/B comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub org_id: OrgId,
    pub interaction_id: InteractionId,
    pub request_id: RequestId,
    pub user_id: UserId,
    pub role: Role,
    pub content: String,
    pub shadow_content: Option<String>,
    pub user_action: UserAction,
    pub user_action_description: Option<String>,
    pub interacted_image_url: Option<String>,
    pub image_encoding: Option<String>,
    pub tools_used: Vec<ToolUse>,
    pub embedding: Vec<f32>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Client payload for one interaction of a publish call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionDraft {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow_content: Option<String>,
    #[serde(default)]
    pub user_action: UserAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_action_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interacted_image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_encoding: Option<String>,
    #[serde(default)]
    pub tools_used: Vec<ToolUse>,
}

/// A derived fact about a user
///
/// At most one `current` row exists per `profile_id`; superseded rows
/// transition to `archived` under the same id. A profile may belong to
/// several extractors when their outputs converge on the same fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub profile_id: Id,
    pub org_id: OrgId,
    pub user_id: UserId,
    pub content: String,
    pub source: String,
    pub extractor_names: BTreeSet<String>,
    pub custom_features: serde_json::Value,
    pub generated_from_request_id: RequestId,
    pub last_modified_at: DateTime<Utc>,
    /// `None` means the profile never expires
    pub expiration_at: Option<DateTime<Utc>>,
    pub status: ArtifactStatus,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl Profile {
    /// Whether the expiration invariant `expiration_at >= last_modified_at`
    /// holds for this row
    pub fn expiration_is_valid(&self) -> bool {
        self.expiration_at
            .map_or(true, |exp| exp >= self.last_modified_at)
    }
}

/// One item of a profile delta produced by the extractor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileDraft {
    pub content: String,
    #[serde(default)]
    pub custom_features: serde_json::Value,
}

/// The outcome of one profile extraction over a window
#[derive(Debug, Clone, Default)]
pub struct ProfileDelta {
    pub add: Vec<ProfileDraft>,
    pub remove: Vec<Id>,
    pub keep: Vec<Id>,
    /// `(superseded_id, replacement)` pairs
    pub replace: Vec<(Id, ProfileDraft)>,
}

impl ProfileDelta {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.replace.is_empty()
    }
}

/// Why an agent could not satisfy a request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockingIssue {
    /// Short classifier label: `missing_capability`, `wrong_tool`,
    /// `policy_block`, `input_ambiguity`, `other`
    pub kind: String,
    pub details: String,
}

/// A single observed behavioral signal about an agent version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFeedback {
    pub raw_feedback_id: Id,
    pub org_id: OrgId,
    pub user_id: Option<UserId>,
    pub agent_version: String,
    pub request_id: RequestId,
    pub source: Option<String>,
    pub feedback_name: String,
    pub feedback_content: String,
    pub do_action: Option<String>,
    pub do_not_action: Option<String>,
    pub when_condition: Option<String>,
    pub blocking_issue: Option<BlockingIssue>,
    pub status: ArtifactStatus,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl RawFeedback {
    /// The text that is embedded and indexed: the `when` clause carries the
    /// triggering condition and is the right retrieval key when present
    pub fn indexed_content(&self) -> &str {
        self.when_condition
            .as_deref()
            .unwrap_or(&self.feedback_content)
    }
}

/// Extractor output before ids, embeddings, and status are assigned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFeedbackDraft {
    pub feedback_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub do_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub do_not_action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking_issue: Option<BlockingIssue>,
}

impl RawFeedbackDraft {
    pub fn indexed_content(&self) -> &str {
        self.when_condition
            .as_deref()
            .unwrap_or(&self.feedback_content)
    }
}

/// Cluster provenance carried by an aggregated feedback
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackMetadata {
    pub raw_feedback_ids: Vec<Id>,
    pub cluster_size: usize,
    pub centroid: Vec<f32>,
}

/// A consolidated behavioral rule built from a cluster of raw feedbacks
///
/// Every aggregate references at least `min_feedback_threshold` raw
/// feedbacks sharing `(agent_version, feedback_name)` whose embeddings
/// cluster together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedFeedback {
    pub feedback_id: Id,
    pub org_id: OrgId,
    pub agent_version: String,
    pub feedback_name: String,
    pub feedback_content: String,
    pub do_action: Option<String>,
    pub do_not_action: Option<String>,
    pub when_condition: Option<String>,
    pub blocking_issue: Option<BlockingIssue>,
    pub feedback_status: ReviewStatus,
    pub feedback_metadata: FeedbackMetadata,
    pub status: ArtifactStatus,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl AggregatedFeedback {
    pub fn indexed_content(&self) -> &str {
        self.when_condition
            .as_deref()
            .unwrap_or(&self.feedback_content)
    }
}

/// A synthesized behavioral rule consumed by downstream agent prompts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub skill_id: Id,
    pub org_id: OrgId,
    pub agent_version: String,
    pub feedback_name: String,
    pub skill_name: String,
    pub description: String,
    pub instructions: String,
    pub allowed_tools: Vec<String>,
    pub blocking_issues: Vec<BlockingIssue>,
    pub raw_feedback_ids: Vec<Id>,
    pub skill_status: SkillStatus,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// Per-request success judgement produced under sampling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEvaluation {
    pub result_id: Id,
    pub org_id: OrgId,
    pub evaluation_name: String,
    pub agent_version: String,
    pub request_id: RequestId,
    pub is_success: bool,
    pub failure_type: Option<String>,
    pub failure_reason: Option<String>,
    pub agent_prompt_update: Option<String>,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// The per-scope concurrency lock row
///
/// One row per extractor scope; triggers that arrive while a run is in
/// flight collapse into `pending_request_id` (at most one queued follow-up).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationState {
    pub org_id: OrgId,
    pub service_name: String,
    pub in_progress: bool,
    pub started_at: DateTime<Utc>,
    pub current_request_id: Option<RequestId>,
    pub pending_request_id: Option<RequestId>,
}

/// Per-request profile delta recorded for the change log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileChangeEntry {
    pub org_id: OrgId,
    pub request_id: RequestId,
    pub user_id: UserId,
    pub extractor_name: String,
    pub added: Vec<Id>,
    pub removed: Vec<Id>,
    pub mentioned: Vec<Id>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indexed_content_prefers_when_condition() {
        let draft = RawFeedbackDraft {
            feedback_content: "agent answered too verbosely".to_string(),
            do_action: None,
            do_not_action: None,
            when_condition: Some("user asks for a summary".to_string()),
            blocking_issue: None,
        };
        assert_eq!(draft.indexed_content(), "user asks for a summary");

        let bare = RawFeedbackDraft {
            when_condition: None,
            ..draft
        };
        assert_eq!(bare.indexed_content(), "agent answered too verbosely");
    }

    #[test]
    fn test_profile_expiration_invariant() {
        let now = current_timestamp();
        let profile = Profile {
            profile_id: new_id(),
            org_id: "org".to_string(),
            user_id: "u1".to_string(),
            content: "prefers blue".to_string(),
            source: "chat".to_string(),
            extractor_names: BTreeSet::from(["preferences".to_string()]),
            custom_features: serde_json::Value::Null,
            generated_from_request_id: "r1".to_string(),
            last_modified_at: now,
            expiration_at: Some(now + chrono::Duration::days(30)),
            status: ArtifactStatus::Current,
            embedding: vec![0.0; 4],
            created_at: now,
        };
        assert!(profile.expiration_is_valid());

        let expired_before_modified = Profile {
            expiration_at: Some(now - chrono::Duration::days(1)),
            ..profile.clone()
        };
        assert!(!expired_before_modified.expiration_is_valid());

        let never_expires = Profile {
            expiration_at: None,
            ..profile
        };
        assert!(never_expires.expiration_is_valid());
    }
}
