//! Error types and result definitions for the harvest storage crates.
//!
//! This crate provides the unified error type ([`Error`]) and result alias ([`Result<T>`])
//! used by the fact store, the catalog store and the service layer built on top of them.
//!
//! # Error Categories
//!
//! - **I/O errors** ([`Error::Io`], [`Error::IoAt`]): disk and filesystem failures, with the offending path
//! - **Data format errors** ([`Error::Arrow`], [`Error::Parquet`], [`Error::CorruptData`])
//! - **Lookup failures** ([`Error::NotFound`]): absent snapshots or metadata
//! - **User input errors** ([`Error::InvalidFilter`], [`Error::InvalidArgumentError`])
//! - **Lifecycle violations** ([`Error::InvalidState`]): e.g. append after finalize
//! - **Catalog errors** ([`Error::Sqlite`], [`Error::AlreadyExists`])
//! - **Internal errors** ([`Error::Internal`]): bugs or poisoned locks

pub mod error;
pub mod result;

pub use error::Error;
pub use result::Result;
