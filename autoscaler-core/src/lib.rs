//! Shared data model, plugin contracts, and pure scaling-decision helpers
//! for the autoscaler engine.
//!
//! This crate has no opinion on *how* policies are discovered or *how*
//! plugins are hosted — it only defines the shapes (`Policy`, `Check`,
//! `ScalingAction`, ...) and the interfaces (`MetricsSource`, `Strategy`,
//! `Target`, `PolicySource`, `HaPoolDiscovery`, `HaLock`) that the engine in
//! `autoscaler-agent` composes into the Policy Manager, Policy Handler,
//! Evaluation Executor and HA Coordinator.

pub mod error;
pub mod ha;
pub mod hashring;
pub mod models;
pub mod plugin;
pub mod policy_source;

pub use error::{AutoscalerError, PluginError, PluginResult, Result};
pub use models::{
    canonicalize, preempt, reduce, reduce_groups, Check, CheckEvaluation, Direction, OnError,
    Policy, PolicyDefaults, PolicyType, PluginRef, ScalingAction, ScalingEvaluation, TargetStatus,
    TimeRange, TimestampedMetric, TimestampedMetrics,
};
pub use plugin::{MetricsSource, PluginInfo, PluginKind, Strategy, Target};
pub use policy_source::{IdSnapshot, PolicySource};
