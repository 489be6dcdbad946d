// src/lib.rs
//! Labor ledger core: reconciles cached attendance and settlement records,
//! aggregates them per worker and guards settlement of the balance.

pub mod aggregation;
pub mod api;
pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod export;
pub mod local_store;
pub mod reconciler;
pub mod record_service;
pub mod records;
pub mod remote;
pub mod status;
pub mod sync_queue;
pub mod trigger;
pub mod views;

mod api_tests;

pub use error::{LedgerError, OperationResult};
