//! lexcrawl collection engine.
//!
//! Given a backing catalog of document records, the engine drives
//! sustained, rate-limited, resumable, quality-gated fetching of artifacts
//! across a bounded worker pool and atomically records outcomes in the
//! catalog and a content-addressed file store.

pub mod cache;
pub mod catalog;
pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod fetch;
pub mod gates;
pub mod governor;

pub use cache::{ArtifactStore, content_hash};
pub use catalog::{
    ArtifactMetadata, CatalogGateway, MemoryCatalogGateway,
    PendingDocument, PersistOutcome, PostgresCatalogGateway,
};
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use classify::{Classification, UrlClassifier, Verdict};
pub use config::CollectorConfig;
pub use dispatch::{CollectorServices, Dispatcher, RunSummary};
pub use error::{CollectError, Result};
pub use events::{CollectEvent, CollectEventBus};
pub use fetch::{
    FetchOutcome, FetchTransport, FetchWorker, FetchedPayload,
    HttpTransportFactory, TransportFactory, WorkItem,
};
pub use gates::{FailureKind, FailureReason, PayloadKind, QualityGates};
pub use governor::{
    EgressId, EgressSelector, RateGovernor, RoundRobinSelector,
};

/// Schema migrations for the catalog tables the engine owns.
pub static MIGRATOR: sqlx::migrate::Migrator =
    sqlx::migrate!("./migrations");
