//! Memory domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::HomecareError;

/// Open key/value metadata attached to a memory. Not interpreted by the core
/// except for the `supersedes` key on candidate facts.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Clinical priority of a memory.
///
/// Variant order matters: `Normal < High < Critical`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = HomecareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(HomecareError::Validation(format!(
                "Unknown priority '{other}'"
            ))),
        }
    }
}

/// Category of a patient memory for at-home care.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    /// Conditions, diagnoses
    MedicalHistory,
    Allergy,
    /// Current medications and dosages
    Medication,
    /// Dietary and comfort preferences
    Preference,
    /// Caregiver notes
    Observation,
    Appointment,
}

impl MemoryCategory {
    pub const ALL: [MemoryCategory; 6] = [
        Self::MedicalHistory,
        Self::Allergy,
        Self::Medication,
        Self::Preference,
        Self::Observation,
        Self::Appointment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MedicalHistory => "medical_history",
            Self::Allergy => "allergy",
            Self::Medication => "medication",
            Self::Preference => "preference",
            Self::Observation => "observation",
            Self::Appointment => "appointment",
        }
    }

    /// Priority a memory of this category gets when nothing raises it.
    pub fn default_priority(&self) -> Priority {
        match self {
            Self::Allergy | Self::Medication => Priority::Critical,
            Self::MedicalHistory => Priority::High,
            Self::Preference | Self::Observation | Self::Appointment => Priority::Normal,
        }
    }
}

impl fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryCategory {
    type Err = HomecareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| HomecareError::Validation(format!("Unknown category '{s}'")))
    }
}

/// A single stored fact about a patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: Uuid,

    /// Owning patient, never changes after creation
    pub patient_id: String,

    pub category: MemoryCategory,

    pub priority: Priority,

    /// 1..=2000 characters
    pub content: String,

    #[serde(default)]
    pub metadata: Metadata,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Soft-delete marker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Memory {
    pub fn new(
        patient_id: impl Into<String>,
        category: MemoryCategory,
        priority: Priority,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            patient_id: patient_id.into(),
            category,
            priority,
            content: content.into(),
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Build a new memory from a reconciled candidate fact.
    pub fn from_candidate(patient_id: impl Into<String>, candidate: &CandidateFact) -> Self {
        let mut memory = Self::new(
            patient_id,
            candidate.category,
            candidate.resolved_priority(),
            candidate.content.trim(),
        );
        memory.metadata = candidate.metadata.clone();
        memory
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// An unvalidated fact proposed by the extraction service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateFact {
    pub category: MemoryCategory,

    /// Priority suggested by the extractor, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,

    pub content: String,

    #[serde(default)]
    pub metadata: Metadata,
}

impl CandidateFact {
    pub fn new(category: MemoryCategory, content: impl Into<String>) -> Self {
        Self {
            category,
            priority: None,
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The category default is a floor: a suggestion can raise it, never lower it.
    pub fn resolved_priority(&self) -> Priority {
        let floor = self.category.default_priority();
        self.priority.map_or(floor, |p| p.max(floor))
    }
}

/// A search hit with its raw similarity to the query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySearchResult {
    pub memory: Memory,

    /// Cosine similarity, clamped to 0.0..=1.0
    pub relevance_score: f32,
}

/// Aggregate view of a patient's active memories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientSummary {
    pub patient_id: String,
    pub total_memories: u64,
    pub critical_memories: u64,
    pub memories_by_category: BTreeMap<MemoryCategory, u64>,
    pub recent_observations: Vec<Memory>,
}

/// Direct update of a memory, bypassing conflict resolution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Merged into existing metadata; a `null` value removes the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl MemoryPatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            metadata: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.metadata.is_none()
    }
}

/// Merge `patch` into `target`. Keys in `patch` win; `null` removes the key.
pub fn merge_metadata(target: &mut Metadata, patch: &Metadata) {
    for (key, value) in patch {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}
