//! fleetgrid-tasks: the manager's task executor.
//!
//! A [`Command`] is one verb's work. The [`TaskRunner`] admits it through
//! the [`MaintenanceGate`], validation and authorization, executes it, and
//! records the outcome in the [`TaskTracker`], which keeps results for a
//! retention window so asynchronous callers can poll them.

pub mod command;
pub mod error;
pub mod maintenance;
pub mod runner;
pub mod tracker;

pub use command::Command;
pub use error::{TaskError, TaskResult};
pub use maintenance::{MaintenanceGate, watch_maintenance_file};
pub use runner::TaskRunner;
pub use tracker::{Task, TaskSnapshot, TaskStatus, TaskTracker, run_eviction};
