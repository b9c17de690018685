//! Classification stabilization: per-identity voting over noisy labels.

mod scheduler;
mod stabilizer;
mod vote;

pub use scheduler::{ClassifyScheduleConfig, ClassifyScheduler, Priority};
pub use stabilizer::{Stabilizer, StabilizerConfig};
pub use vote::{Decision, Label, Vote, VoteRecord};
