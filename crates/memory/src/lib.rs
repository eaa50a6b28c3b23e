//! Patient memory core for the homecare assistant.
//!
//! Conversations are turned into durable, categorized facts about a patient
//! and recalled later by semantic search, with safety-critical facts
//! (allergies, medications) ranked ahead of casual ones.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    MEMORY COORDINATOR                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │   conversation ──► FactExtractor ──► Embedder (batch)       │
//! │                                          │                  │
//! │                     ┌────────────────────┘                  │
//! │                     ▼  per-patient lock                     │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │  ConflictResolver: insert / update / skip            │   │
//! │  │  pending row ─► index upsert ─► commit               │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! │                     │                                       │
//! │          ┌──────────┴───────────┐                           │
//! │          ▼                      ▼                           │
//! │  ┌──────────────┐      ┌────────────────┐                   │
//! │  │  Repository  │      │  Vector index  │                   │
//! │  │ (in-memory / │      │ (in-memory /   │                   │
//! │  │  PostgreSQL) │      │  pgvector)     │                   │
//! │  └──────────────┘      └────────────────┘                   │
//! │          ▲                      ▲                           │
//! │          └──────────┬───────────┘                           │
//! │                     │                                       │
//! │   query ──► Embedder ──► RankingEngine (priority boost)     │
//! │                                                             │
//! │   Reconciler: repairs store/index drift in the background   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod coordinator;
mod deadline;
pub mod embedding;
pub mod index;
pub mod locks;
pub mod pg_index;
pub mod postgres;
pub mod ranking;
pub mod reconcile;
pub mod resolver;
pub mod similarity;
pub mod store;

pub use config::{MemoryConfig, PriorityWeights};
pub use coordinator::{CandidateFailure, IngestReport, MemoryCoordinator};
pub use embedding::HashingEmbedder;
#[cfg(feature = "local-embeddings")]
pub use embedding::FastEmbedder;
pub use index::InMemoryVectorIndex;
pub use locks::{PatientGuard, PatientLocks};
pub use pg_index::PgVectorIndex;
pub use postgres::{connect, PostgresRepository};
pub use ranking::RankingEngine;
pub use reconcile::{Reconciler, RepairReport};
pub use resolver::{ConflictResolver, Decision};
pub use store::InMemoryRepository;
