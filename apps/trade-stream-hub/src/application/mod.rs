//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the ingestion pipeline and the port interfaces that
//! describe how it talks to the trade store and the upstream feed.

/// Port interfaces for external systems (trade store, upstream feed).
pub mod ports;

/// Application services (ingestion pipeline).
pub mod services;
