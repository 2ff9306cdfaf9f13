//! # tw-clock
//!
//! Reconciles the local wall clock against NTP and against each exchange's
//! own server clock.
//!
//! - [`prober::ExchangeTimeProber`] asks an exchange for its server time and
//!   estimates one-way latency as half the round trip.
//! - [`ntp::SntpClient`] measures the local clock's offset from NTP.
//! - [`sync::ClockSyncService`] folds both into the trading-timestamp
//!   accessor and a health signal. It implements [`tw_core::clock::Clock`],
//!   so it can be handed to anything that stamps time.

pub mod error;
pub mod event;
pub mod ntp;
pub mod prober;
pub mod sample;
pub mod sync;

pub use error::ClockError;
pub use event::ClockEvent;
pub use ntp::SntpClient;
pub use prober::{ExchangeTimeProber, ServerTimeSource};
pub use sample::{ClockStats, DriftWarning, ExchangeTimeInfo, NtpMeasurement, TimeOffsetSample};
pub use sync::ClockSyncService;
