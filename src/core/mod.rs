//! Core runtime infrastructure.
//!
//! This module contains the essential components for running blobkv:
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Component lifecycle and shutdown
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod runtime;
