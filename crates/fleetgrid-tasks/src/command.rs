//! The command contract every RPC verb implements.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TaskResult;
use crate::tracker::Task;

/// One verb's unit of work.
///
/// The runner calls `validate`, then `authorize`, then `execute`, and
/// records the outcome; a command never calls these itself.
#[async_trait]
pub trait Command: Send + Sync + 'static {
    /// Verb name, e.g. `ReserveRouterPort`.
    fn name(&self) -> &'static str;

    /// Acting user, for the audit trail.
    fn user(&self) -> &str;

    /// One-line audit description.
    fn description(&self) -> String;

    /// Whether the command may run while the manager is in maintenance.
    fn allow_during_maintenance(&self) -> bool {
        false
    }

    /// Reject malformed arguments before any state is read.
    fn validate(&self) -> TaskResult<()> {
        Ok(())
    }

    async fn authorize(&self) -> TaskResult<()>;

    /// Perform the mutation. Effects applied before an error are kept.
    async fn execute(&self, task: &Task) -> TaskResult<Value>;
}
