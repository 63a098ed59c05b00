//! Data model for the five logical collections.
//!
//! Translated from the source `dataclasses` (`ConversationMemory`,
//! `SummaryMemory`, `MemoryIndexItem`, `MemoryScope`, `UserProfileItem`) into
//! plain serde structs. Ids are surrogate strings (UUIDv4 by default); the
//! store layer is the only writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// One utterance in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationMessage {
    pub id: String,
    pub conversation_id: String,
    pub speaker: Speaker,
    pub text: String,
    pub scope: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub timestamp: DateTime<Utc>,
}

/// Who said a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Speaker::User => write!(f, "user"),
            Speaker::Assistant => write!(f, "assistant"),
        }
    }
}

impl std::str::FromStr for Speaker {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Speaker::User),
            "assistant" => Ok(Speaker::Assistant),
            other => Err(crate::error::EngineError::InvalidRequest(format!(
                "unknown speaker: {other}"
            ))),
        }
    }
}

/// A derived memory summarizing a range of messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Summary {
    pub id: String,
    pub conversation_id: Option<String>,
    pub topic_id: Option<String>,
    pub summary_text: String,
    pub scope: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub timestamp: DateTime<Utc>,
    pub time_range: TimeRange,
    pub message_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// Which collection a `VectorIndexEntry` is slaved to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceCollection {
    ConversationHistory,
    Summaries,
}

impl SourceCollection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceCollection::ConversationHistory => "conversation_history",
            SourceCollection::Summaries => "summaries",
        }
    }
}

impl std::str::FromStr for SourceCollection {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversation_history" => Ok(SourceCollection::ConversationHistory),
            "summaries" => Ok(SourceCollection::Summaries),
            other => Err(crate::error::EngineError::Internal(format!(
                "unknown source collection: {other}"
            ))),
        }
    }
}

/// Secondary index row backing semantic search.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorIndexEntry {
    pub id: String,
    pub embedding: Vec<f32>,
    pub source_collection: SourceCollection,
    pub source_id: String,
    pub scope: String,
    pub metadata: VectorIndexMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VectorIndexMetadata {
    #[serde(default)]
    pub text_preview: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A named namespace grouping related memories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scope {
    pub id: String,
    pub scope_name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub active: bool,
    #[serde(default)]
    pub related_keywords: Vec<String>,
    pub parent_scope: Option<String>,
}

impl Scope {
    pub fn new_active(scope_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            scope_name: scope_name.into(),
            description: description.into(),
            created_at: Utc::now(),
            active: true,
            related_keywords: Vec::new(),
            parent_scope: None,
        }
    }
}

/// A key/value fact about the user. Not ranked in retrieval.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfileItem {
    pub id: String,
    pub user_id: String,
    pub key: String,
    pub value: serde_json::Value,
    pub category: String,
}

impl Default for UserProfileItem {
    fn default() -> Self {
        Self {
            id: new_id(),
            user_id: "default_user".to_string(),
            key: String::new(),
            value: serde_json::Value::Null,
            category: "facts".to_string(),
        }
    }
}
