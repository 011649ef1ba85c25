//! Built-in plugins (§11): registered and dispensed through the same
//! `PluginManager` code path as an external subprocess plugin, so a policy
//! cannot tell the difference between a built-in strategy and one loaded
//! from the plugin directory.

pub mod metrics;
pub mod strategies;
pub mod targets;
