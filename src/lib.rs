//! Tollgate - In-process Rate Limiting for Mutating API Requests
//!
//! This crate decides, per incoming mutating request, whether to admit or
//! reject it based on how many similar requests the same caller made recently.
//! Counting uses a two-window sliding approximation held in a sharded
//! in-memory map, so no external store is involved.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{Result, TollgateError};
