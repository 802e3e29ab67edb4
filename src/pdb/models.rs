use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

use crate::error::HarvestError;

/// Numeric key of one profile on the remote source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(pub i64);

impl ProfileId {
    pub fn get(self) -> i64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ProfileId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

/// Row written to the `profiles` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub id: ProfileId,
    pub mbti_profile: String,
    /// Kept exactly as delivered; usually a string, sometimes structured or null.
    pub wiki_description: Value,
    pub sub_cat_id: i64,
    pub cat_id: i64,
    pub property_id: i64,
    pub total_vote_counts: i64,
}

impl ProfileRecord {
    /// Pull the primary fields out of a `/profile/{id}` payload. Any missing or
    /// mistyped field is a schema mismatch and fails the whole profile.
    pub fn from_payload(requested: ProfileId, payload: &Value) -> Result<Self, HarvestError> {
        let id = required_i64(payload, "/id")?;
        if id != requested.get() {
            return Err(HarvestError::schema(format!(
                "payload id {id} does not match requested profile {requested}"
            )));
        }
        let mbti_profile = payload
            .get("mbti_profile")
            .and_then(Value::as_str)
            .ok_or_else(|| missing("/mbti_profile"))?
            .to_string();
        let wiki_description = payload
            .get("wiki_description")
            .cloned()
            .ok_or_else(|| missing("/wiki_description"))?;

        Ok(Self {
            id: requested,
            mbti_profile,
            wiki_description,
            sub_cat_id: required_i64(payload, "/subcat_link_info/sub_cat_id")?,
            cat_id: required_i64(payload, "/subcat_link_info/cat_id")?,
            property_id: required_i64(payload, "/subcat_link_info/property_id")?,
            total_vote_counts: required_i64(payload, "/total_vote_counts")?,
        })
    }

    /// Text stored in the `wiki_description` column.
    pub fn wiki_description_text(&self) -> Option<String> {
        match &self.wiki_description {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}

fn missing(pointer: &str) -> HarvestError {
    HarvestError::schema(format!("missing or mistyped field {pointer}"))
}

fn required_i64(payload: &Value, pointer: &str) -> Result<i64, HarvestError> {
    payload
        .pointer(pointer)
        .and_then(Value::as_i64)
        .ok_or_else(|| missing(pointer))
}

/// One vote bucket inside a breakdown system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeVote {
    pub personality_type: String,
    #[serde(rename = "theCount")]
    pub vote_count: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Typing document written next to the profile row as `{id}_typing.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingBreakdown {
    pub functions: Value,
    pub systems: Value,
    pub breakdown_systems: IndexMap<String, Vec<TypeVote>>,
    pub breakdown_config: Value,
    #[serde(rename = "mbti_letter_stats")]
    pub letter_stats: Value,
}

impl TypingBreakdown {
    /// Absent sections fall back to empty containers; a present but malformed
    /// `breakdown_systems` rejects the profile.
    pub fn from_payload(payload: &Value) -> Result<Self, HarvestError> {
        let breakdown_systems = match payload.get("breakdown_systems") {
            None | Some(Value::Null) => IndexMap::new(),
            Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
                HarvestError::schema(format!("malformed breakdown_systems: {e}"))
            })?,
        };

        Ok(Self {
            functions: section_or(payload, "functions", json!([])),
            systems: section_or(payload, "systems", json!([])),
            breakdown_systems,
            breakdown_config: section_or(payload, "breakdown_config", json!({})),
            letter_stats: section_or(payload, "mbti_letter_stats", json!([])),
        })
    }

    /// Highest-voted type per system. Ties keep the first entry in remote order.
    pub fn leading_types(&self) -> IndexMap<&str, &TypeVote> {
        let mut out = IndexMap::new();
        for (system, votes) in &self.breakdown_systems {
            let mut best: Option<&TypeVote> = None;
            for vote in votes {
                if best.map_or(true, |b| vote.vote_count > b.vote_count) {
                    best = Some(vote);
                }
            }
            if let Some(best) = best {
                out.insert(system.as_str(), best);
            }
        }
        out
    }
}

fn section_or(payload: &Value, key: &str, default: Value) -> Value {
    match payload.get(key) {
        None | Some(Value::Null) => default,
        Some(v) => v.clone(),
    }
}

/// One page of `/comments/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct CommentPage {
    #[serde(default, alias = "items")]
    pub comments: Vec<Value>,
    #[serde(default)]
    pub next_offset: Option<i64>,
    #[serde(default)]
    pub has_more: bool,
}

/// All comment pages for one profile, concatenated in delivery order.
#[derive(Debug, Default)]
pub struct CommentThread {
    pub items: Vec<Value>,
    pub pages: usize,
    /// Why collection ended before the remote said `has_more = false`.
    pub stopped_early: Option<HarvestError>,
}

impl CommentThread {
    pub fn is_partial(&self) -> bool {
        self.stopped_early.is_some()
    }
}
