//! Dispatch core for Gangplank: resolves a `JobSpec` into a wave-scheduled
//! plan, drives readiness polling, stage dispatch and termination.
//!
//! The supervisor owns the run end-to-end: [`seed`] populates the store
//! with what a freshly-dispatched worker needs before any stage is ready,
//! [`plan::form_plan`] partitions stages into execution-order waves,
//! [`readiness::wait_ready`] blocks a stage until its dependencies exist,
//! [`dispatch::Supervisor::exec`] drives the waves to completion or first
//! failure, and [`termination::TerminationMultiplexer`] is the single
//! place a run's shutdown signal is ever produced.

pub mod dispatch;
pub mod error;
pub mod plan;
pub mod readiness;
pub mod seed;
pub mod termination;

pub use dispatch::Supervisor;
pub use error::{Result, SupervisorError};
pub use plan::{form_plan, Wave};
pub use readiness::{wait_ready, BuildPin, ReadinessResult};
pub use termination::{TerminateHandle, TerminateSubscriber, TerminationMultiplexer};
