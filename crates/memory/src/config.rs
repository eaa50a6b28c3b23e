//! Tunables for the memory core.

use std::time::Duration;

use homecare_common::{HomecareError, Priority, Result};
use serde::{Deserialize, Serialize};

/// Ranking boost added to the similarity score of each priority.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityWeights {
    #[serde(default = "default_critical_weight")]
    pub critical: f32,
    #[serde(default = "default_high_weight")]
    pub high: f32,
    #[serde(default)]
    pub normal: f32,
}

fn default_critical_weight() -> f32 {
    0.35
}

fn default_high_weight() -> f32 {
    0.15
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            critical: default_critical_weight(),
            high: default_high_weight(),
            normal: 0.0,
        }
    }
}

impl PriorityWeights {
    pub fn weight(&self, priority: Priority) -> f32 {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
        }
    }
}

/// Memory core configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Similarity at or above which a candidate updates an existing memory
    #[serde(default = "default_update_threshold")]
    pub update_threshold: f32,

    /// Lower bound of the band where a critical pair needs disambiguation
    #[serde(default = "default_contradiction_floor")]
    pub contradiction_floor: f32,

    #[serde(default)]
    pub priority_weights: PriorityWeights,

    /// Index candidates fetched per requested result
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,

    #[serde(default = "default_search_limit")]
    pub default_search_limit: usize,

    #[serde(default = "default_max_search_limit")]
    pub max_search_limit: usize,

    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,

    #[serde(default = "default_extraction_timeout")]
    pub extraction_timeout_ms: u64,

    #[serde(default = "default_embedding_timeout")]
    pub embedding_timeout_ms: u64,

    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    #[serde(default = "default_index_timeout")]
    pub index_timeout_ms: u64,

    /// Window for the observations listed in a patient summary
    #[serde(default = "default_recent_observation_days")]
    pub recent_observation_days: i64,

    #[serde(default = "default_recent_observation_limit")]
    pub recent_observation_limit: usize,
}

fn default_update_threshold() -> f32 {
    0.85
}

fn default_contradiction_floor() -> f32 {
    0.50
}

fn default_candidate_multiplier() -> usize {
    3
}

fn default_search_limit() -> usize {
    3
}

fn default_max_search_limit() -> usize {
    10
}

fn default_embedding_dimension() -> usize {
    1536
}

fn default_extraction_timeout() -> u64 {
    30_000
}

fn default_embedding_timeout() -> u64 {
    10_000
}

fn default_store_timeout() -> u64 {
    5_000
}

fn default_index_timeout() -> u64 {
    5_000
}

fn default_recent_observation_days() -> i64 {
    30
}

fn default_recent_observation_limit() -> usize {
    10
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            update_threshold: default_update_threshold(),
            contradiction_floor: default_contradiction_floor(),
            priority_weights: PriorityWeights::default(),
            candidate_multiplier: default_candidate_multiplier(),
            default_search_limit: default_search_limit(),
            max_search_limit: default_max_search_limit(),
            embedding_dimension: default_embedding_dimension(),
            extraction_timeout_ms: default_extraction_timeout(),
            embedding_timeout_ms: default_embedding_timeout(),
            store_timeout_ms: default_store_timeout(),
            index_timeout_ms: default_index_timeout(),
            recent_observation_days: default_recent_observation_days(),
            recent_observation_limit: default_recent_observation_limit(),
        }
    }
}

impl MemoryConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.contradiction_floor > 0.0
            && self.contradiction_floor < self.update_threshold
            && self.update_threshold <= 1.0)
        {
            return Err(HomecareError::Config(format!(
                "Thresholds must satisfy 0 < contradiction_floor ({}) < update_threshold ({}) <= 1",
                self.contradiction_floor, self.update_threshold
            )));
        }

        let w = &self.priority_weights;
        if !(w.critical > w.high && w.high > w.normal && w.normal == 0.0) {
            return Err(HomecareError::Config(format!(
                "Priority weights must satisfy critical ({}) > high ({}) > normal ({}) == 0",
                w.critical, w.high, w.normal
            )));
        }

        if self.candidate_multiplier == 0 {
            return Err(HomecareError::Config(
                "candidate_multiplier must be at least 1".to_string(),
            ));
        }
        if self.max_search_limit == 0
            || self.default_search_limit == 0
            || self.default_search_limit > self.max_search_limit
        {
            return Err(HomecareError::Config(format!(
                "Search limits must satisfy 1 <= default ({}) <= max ({})",
                self.default_search_limit, self.max_search_limit
            )));
        }
        if self.embedding_dimension == 0 {
            return Err(HomecareError::Config(
                "embedding_dimension must be positive".to_string(),
            ));
        }
        for (name, ms) in [
            ("extraction_timeout_ms", self.extraction_timeout_ms),
            ("embedding_timeout_ms", self.embedding_timeout_ms),
            ("store_timeout_ms", self.store_timeout_ms),
            ("index_timeout_ms", self.index_timeout_ms),
        ] {
            if ms == 0 {
                return Err(HomecareError::Config(format!("{name} must be positive")));
            }
        }
        if self.recent_observation_days < 0 {
            return Err(HomecareError::Config(
                "recent_observation_days must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_millis(self.extraction_timeout_ms)
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_millis(self.embedding_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn index_timeout(&self) -> Duration {
        Duration::from_millis(self.index_timeout_ms)
    }
}
