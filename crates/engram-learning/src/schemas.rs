//! Structured-output schemas for the extraction LLM calls
//!
//! Strict JSON-schema mode requires an object root, so list outputs are
//! wrapped in `{"items": [...]}`. The serde structs next to each schema are
//! the decode targets.

use engram_core::BlockingIssue;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Blocking-issue classifier labels accepted from the model
pub const BLOCKING_ISSUE_KINDS: [&str; 5] = [
    "missing_capability",
    "wrong_tool",
    "policy_block",
    "input_ambiguity",
    "other",
];

/// Output of a gate call
#[derive(Debug, Clone, Deserialize)]
pub struct GateDecision {
    pub should_extract: bool,
}

pub fn gate_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "should_extract": {"type": "boolean"}
        },
        "required": ["should_extract"],
        "additionalProperties": false
    })
}

/// One action of the profile delta output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileActionItem {
    pub action: ProfileActionKind,
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub custom_features: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileActionKind {
    Add,
    Replace,
    Keep,
    Drop,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProfileDeltaOutput {
    pub items: Vec<ProfileActionItem>,
}

pub fn profile_delta_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "action": {"type": "string", "enum": ["add", "replace", "keep", "drop"]},
                        "profile_id": {"type": ["string", "null"]},
                        "content": {"type": ["string", "null"]},
                        "custom_features": {"type": ["object", "null"]}
                    },
                    "required": ["action"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["items"],
        "additionalProperties": false
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockingIssueOutput {
    pub kind: String,
    #[serde(default)]
    pub details: String,
}

impl BlockingIssueOutput {
    pub fn into_issue(self) -> BlockingIssue {
        let kind = if BLOCKING_ISSUE_KINDS.contains(&self.kind.as_str()) {
            self.kind
        } else {
            "other".to_string()
        };
        BlockingIssue {
            kind,
            details: self.details,
        }
    }
}

/// One extracted feedback tuple
#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackItemOutput {
    pub feedback_content: String,
    #[serde(default)]
    pub do_action: Option<String>,
    #[serde(default)]
    pub do_not_action: Option<String>,
    #[serde(default)]
    pub when_condition: Option<String>,
    #[serde(default)]
    pub blocking_issue: Option<BlockingIssueOutput>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackListOutput {
    pub items: Vec<FeedbackItemOutput>,
}

fn blocking_issue_schema() -> Value {
    json!({
        "type": ["object", "null"],
        "properties": {
            "kind": {"type": "string"},
            "details": {"type": "string"}
        },
        "required": ["kind"],
        "additionalProperties": false
    })
}

pub fn feedback_list_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "feedback_content": {"type": "string"},
                        "do_action": {"type": ["string", "null"]},
                        "do_not_action": {"type": ["string", "null"]},
                        "when_condition": {"type": ["string", "null"]},
                        "blocking_issue": blocking_issue_schema(),
                    },
                    "required": ["feedback_content"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["items"],
        "additionalProperties": false
    })
}

/// Consolidated rule produced from one cluster
#[derive(Debug, Clone, Deserialize)]
pub struct AggregateOutput {
    pub feedback_content: String,
    #[serde(default)]
    pub do_action: Option<String>,
    #[serde(default)]
    pub do_not_action: Option<String>,
    #[serde(default)]
    pub when_condition: Option<String>,
    #[serde(default)]
    pub blocking_issue: Option<BlockingIssueOutput>,
}

pub fn aggregate_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "feedback_content": {"type": "string"},
            "do_action": {"type": ["string", "null"]},
            "do_not_action": {"type": ["string", "null"]},
            "when_condition": {"type": ["string", "null"]},
            "blocking_issue": blocking_issue_schema(),
        },
        "required": ["feedback_content"],
        "additionalProperties": false
    })
}

/// Per-request success judgement
#[derive(Debug, Clone, Deserialize)]
pub struct SuccessOutput {
    pub is_success: bool,
    #[serde(default)]
    pub failure_type: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub agent_prompt_update: Option<String>,
}

pub fn success_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "is_success": {"type": "boolean"},
            "failure_type": {"type": ["string", "null"]},
            "failure_reason": {"type": ["string", "null"]},
            "agent_prompt_update": {"type": ["string", "null"]}
        },
        "required": ["is_success"],
        "additionalProperties": false
    })
}

/// Skill synthesized from an approved aggregate
#[derive(Debug, Clone, Deserialize)]
pub struct SkillOutput {
    pub skill_name: String,
    pub description: String,
    pub instructions: String,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

pub fn skill_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "skill_name": {"type": "string"},
            "description": {"type": "string"},
            "instructions": {"type": "string"},
            "allowed_tools": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["skill_name", "description", "instructions"],
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_delta_decodes() {
        let value = json!({
            "items": [
                {"action": "add", "content": "prefers blue shirts"},
                {"action": "replace", "profile_id": "abc", "content": "prefers navy"},
                {"action": "keep", "profile_id": "def"},
                {"action": "drop", "profile_id": "ghi"}
            ]
        });
        let decoded: ProfileDeltaOutput = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.items.len(), 4);
        assert_eq!(decoded.items[0].action, ProfileActionKind::Add);
        assert_eq!(decoded.items[1].profile_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_unknown_blocking_kind_folds_to_other() {
        let output = BlockingIssueOutput {
            kind: "cosmic_rays".to_string(),
            details: "bit flip".to_string(),
        };
        assert_eq!(output.into_issue().kind, "other");

        let known = BlockingIssueOutput {
            kind: "wrong_tool".to_string(),
            details: String::new(),
        };
        assert_eq!(known.into_issue().kind, "wrong_tool");
    }

    #[test]
    fn test_feedback_list_decodes_minimal_item() {
        let value = json!({"items": [{"feedback_content": "too verbose"}]});
        let decoded: FeedbackListOutput = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.items.len(), 1);
        assert!(decoded.items[0].when_condition.is_none());
    }
}
