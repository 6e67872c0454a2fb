//! Protection and gain-compensation runtime for a smart speaker amplifier.
//!
//! The pieces share one [`protection::ProtectionController`], which owns the
//! device state behind a single lock. Everything that touches hardware goes
//! through a [`regmap::RegisterPort`].

pub mod amplifier;
pub mod clock;
pub mod compensation;
pub mod config;
pub mod diag;
pub mod error;
pub mod fault;
pub mod protection;
pub mod regmap;
pub mod sensor;
pub mod sequencer;
pub mod tracing;
