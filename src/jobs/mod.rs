//! Blur Job Manager
//!
//! Background generation of blurred derivatives for sensitive items:
//! - Per-item state machine (None, Queued, Processing, Stopping, Complete)
//! - Cooperative cancellation checked before every image
//! - Progress and mapping persisted after every image, so reruns resume
//! - Per-image failures isolated from the rest of the job

mod manager;
mod scheduler;


pub use manager::{can_transition, BlurJobManager, EnqueueOutcome, FlagChange, RunReport, StopOutcome};
pub use scheduler::{ManualScheduler, ScheduledTask, Scheduler, TokioScheduler};
