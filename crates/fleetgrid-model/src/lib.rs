//! fleetgrid-model: typed records over the coordination store.
//!
//! [`Registry`] owns a store handle, the manager's session, the path
//! [`Layout`], the router [`PortRange`], and the at-rest [`Cipher`]. Each
//! record module adds its operations to `Registry`:
//!
//! | Module | Records |
//! |---|---|
//! | [`app`] | app registrations, depender env/app data |
//! | [`env`] | environments and dependency values |
//! | [`instance`] | containers placed on supervisor hosts |
//! | [`manager`] | manager registrations and roles |
//! | [`router`] | router process registry |
//! | [`router_ports`] | (app, env) → port, rules, tries, port bindings |
//! | [`pool`] | load-balancer pools per (app, sha, env) |
//! | [`team_apps`] | team → permitted apps |
//!
//! Mutations that read before they write hold one named lock at a time;
//! no operation nests two.

pub mod app;
pub mod crypto;
pub mod env;
pub mod error;
pub mod instance;
pub mod layout;
pub mod manager;
pub mod pool;
pub mod registry;
pub mod router;
pub mod router_ports;
pub mod team_apps;

pub use app::{App, AppSpec, DependerAppData, DependerEnvData};
pub use crypto::Cipher;
pub use env::{Env, EnvDep};
pub use error::{ModelError, ModelResult};
pub use instance::{Instance, InstanceStatus, parse_instance_id};
pub use layout::{Layout, Scope, pool_name, trie_name, validate_name, validate_segment};
pub use manager::ManagerRecord;
pub use pool::{Pool, PoolConfig, PoolHost};
pub use registry::{DEFAULT_ROOT, Registry};
pub use router::RouterRecord;
pub use router_ports::{PortBinding, PortRange, PortReservation, RouterPort, Rule, Trie};
pub use team_apps::TeamApps;
