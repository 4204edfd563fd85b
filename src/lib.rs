//! Meadow Ingest
//!
//! Measurement ingestion and decoding pipeline for the Meadow
//! environmental sensor network. Citizen-operated devices upload
//! telemetry in whatever format their firmware speaks — JSON, CSV,
//! compact binary frames, or the luftdaten.info and hackAIR push formats
//! — and this crate normalizes all of it into canonical measurements,
//! validates geospatial and temporal fields, and hands validated batches
//! to a storage backend that reconciles device location history against
//! out-of-order, retroactively-timestamped submissions.
//!
//! ## Architecture
//!
//! ```text
//! raw body + headers          IngestService              MeasurementStore
//! ┌──────────────┐      ┌─────────────────────┐      ┌──────────────────┐
//! │ JSON         │      │ resolve decoder     │      │ get_device       │
//! │ CSV          │─────▶│ token policy        │─────▶│ save_measurements│
//! │ sbx-bytes    │      │ decode + validate   │      │  + location      │
//! │ sbx-bytes-ts │      │ one batched write   │      │  reconciliation  │
//! │ luftdaten    │      └─────────────────────┘      └──────────────────┘
//! │ hackAIR      │            │        │                Memory / Postgres
//! └──────────────┘            ▼        ▼
//!                      sensor_matcher  location
//!                      (vendor alias   (normalize +
//!                       resolution)     range check)
//! ```
//!
//! Decoding is synchronous and pure; all cross-request state (location
//! history, current-location pointer) lives behind the store trait.

pub mod binary_decoder;
pub mod config;
pub mod decoding;
pub mod error;
pub mod ingest;
pub mod location;
pub mod models;
pub mod postgres_store;
pub mod sensor_matcher;
pub mod store;

pub use config::{Config, DatabaseConfig, ServiceConfig};
pub use decoding::{decode_measurements, DecodeError, PayloadFormat};
pub use error::IngestError;
pub use ingest::{IngestService, PostMeasurementsOptions, SingleMeasurementBody};
pub use models::{Device, Location, Measurement, Sensor};
pub use postgres_store::PostgresStore;
pub use store::{LocationRecord, MeasurementStore, MemoryStore, StoredMeasurement};
