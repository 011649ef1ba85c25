//! Autoscaler agent: the Policy Manager, per-policy Policy Handlers, the
//! Evaluation Executor, the HA Coordinator, the Plugin Manager, and the
//! Target Status / Node Eligibility watchers that the binary in `main.rs`
//! wires together.

pub mod agent_id;
pub mod config;
pub mod executor;
pub mod ha;
pub mod node_watcher;
pub mod observability;
pub mod plugin_manager;
pub mod plugins;
pub mod policy_handler;
pub mod policy_manager;
pub mod policy_sources;
pub mod target_watcher;

pub use config::Config;
pub use executor::Executor;
pub use plugin_manager::PluginManager;
pub use policy_manager::PolicyManager;
