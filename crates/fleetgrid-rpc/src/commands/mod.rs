//! One command type per RPC verb.
//!
//! A verb is declared with [`verb!`], which generates the struct and its
//! [`VerbSpec`]; the behaviour lives in a hand-written [`Verb`] impl. The
//! runner sees every verb through [`Call`], so the
//! validate/authorize/execute/audit sequence exists once.

pub mod apps;
pub mod containers;
pub mod deploy;
pub mod envs;
pub mod managers;
pub mod routing;
pub mod teams;

use std::sync::Arc;

use async_trait::async_trait;
use fleetgrid_tasks::{Command, Task, TaskError, TaskResult};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::auth::AuthArg;
use crate::context::ManagerContext;

/// Identity and construction of a verb.
pub trait VerbSpec: Sized {
    const NAME: &'static str;
    type Arg: DeserializeOwned + Send + Sync + 'static;

    fn new(ctx: Arc<ManagerContext>, arg: Self::Arg) -> Self;
    fn auth(&self) -> &AuthArg;
}

/// Behaviour of a verb.
#[async_trait]
pub trait Verb: VerbSpec + Send + Sync + 'static {
    fn description(&self) -> String;

    fn allow_during_maintenance(&self) -> bool {
        false
    }

    fn validate(&self) -> TaskResult<()> {
        Ok(())
    }

    async fn authorize(&self) -> TaskResult<()>;

    async fn execute(&self, task: &Task) -> TaskResult<Value>;
}

/// Adapter handing a verb to the task runner.
pub struct Call<V>(pub V);

#[async_trait]
impl<V: Verb> Command for Call<V> {
    fn name(&self) -> &'static str {
        V::NAME
    }

    fn user(&self) -> &str {
        &self.0.auth().user
    }

    fn description(&self) -> String {
        self.0.description()
    }

    fn allow_during_maintenance(&self) -> bool {
        self.0.allow_during_maintenance()
    }

    fn validate(&self) -> TaskResult<()> {
        self.0.validate()
    }

    async fn authorize(&self) -> TaskResult<()> {
        self.0.authorize().await
    }

    async fn execute(&self, task: &Task) -> TaskResult<Value> {
        self.0.execute(task).await
    }
}

/// Declare a verb struct holding the context and its argument.
macro_rules! verb {
    ($(#[$meta:meta])* $name:ident($arg:ty)) => {
        $(#[$meta])*
        pub struct $name {
            ctx: ::std::sync::Arc<$crate::context::ManagerContext>,
            arg: $arg,
        }

        impl $crate::commands::VerbSpec for $name {
            const NAME: &'static str = stringify!($name);
            type Arg = $arg;

            fn new(ctx: ::std::sync::Arc<$crate::context::ManagerContext>, arg: $arg) -> Self {
                Self { ctx, arg }
            }

            fn auth(&self) -> &$crate::auth::AuthArg {
                &self.arg.auth
            }
        }
    };
}
pub(crate) use verb;

/// Reject an empty required field.
pub(crate) fn require(field: &str, value: &str) -> TaskResult<()> {
    if value.trim().is_empty() {
        return Err(TaskError::missing(field));
    }
    Ok(())
}

/// Serialize a reply payload.
pub(crate) fn to_value<T: serde::Serialize>(value: T) -> TaskResult<Value> {
    serde_json::to_value(value).map_err(|e| TaskError::Internal(e.to_string()))
}
