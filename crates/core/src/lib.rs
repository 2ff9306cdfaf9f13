//! # tw-core
//!
//! Shared building blocks for the tradewire exchange-connectivity core.
//!
//! This crate provides the wall-clock [`types::Timestamp`], the
//! [`clock::Clock`] abstraction every component stamps time through, the
//! canonical market data events produced by the feed normalizer, layered
//! configuration, and the logging setup.

pub mod clock;
pub mod config;
pub mod logging;
pub mod types;
