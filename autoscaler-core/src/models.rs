//! Shared data model: policies, checks, metrics, target status and scaling
//! actions, plus the pure helpers (`canonicalize`, `cap_count`, `preempt`,
//! group/global reduction) that the evaluation executor composes.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Built-in metrics source name whose short-form queries get expanded during
/// canonicalization (§3: `op_metric` -> `op_metric/<group>/<job>`).
pub const BUILTIN_METRICS_SOURCE: &str = "orchestrator-apm";

/// Built-in target name substituted for a `horizontal` policy with no
/// explicit `target.name`.
pub const BUILTIN_TARGET_NAME: &str = "orchestrator-task-group";

/// How a policy (or an individual check) reacts to a failed evaluation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Drop the failing check (or, at policy level, log and move on).
    Ignore,
    /// Abort the whole evaluation; the handler retries on the next tick.
    Fail,
    /// Only valid on a `Check`: defer to the policy's `on_check_error`.
    Inherit,
}

/// The scaling strategy a policy uses: a horizontal count of instances, or a
/// cluster-wide strategy, or an extension-defined tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    Horizontal,
    Cluster,
    /// Anything else a plugin wants to define; carried opaquely.
    Extension(String),
}

/// `{name, config}` pair shared by `target` and `check.strategy`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRef {
    pub name: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl PluginRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: HashMap::new(),
        }
    }
}

/// One `{metrics source, query, strategy}` triple within a policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub source: String,
    pub query: String,
    #[serde(with = "duration_seconds")]
    pub query_window: Duration,
    #[serde(with = "duration_seconds")]
    pub query_window_offset: Duration,
    pub on_error: OnError,
    pub group: Option<String>,
    pub strategy: PluginRef,
}

/// The unit the engine schedules: a declarative description of how one
/// target should be scaled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub enabled: bool,
    #[serde(rename = "type")]
    pub policy_type: PolicyType,
    pub min: i64,
    pub max: i64,
    #[serde(with = "duration_seconds")]
    pub cooldown: Duration,
    #[serde(with = "duration_seconds")]
    pub evaluation_interval: Duration,
    pub on_check_error: OnError,
    pub target: PluginRef,
    pub checks: Vec<Check>,
}

/// Process-wide fallbacks injected at construction time; there is no mutable
/// global default store (see design note in §9).
#[derive(Debug, Clone, Copy)]
pub struct PolicyDefaults {
    pub cooldown: Duration,
    pub evaluation_interval: Duration,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(300),
            evaluation_interval: Duration::from_secs(10),
        }
    }
}

/// Canonicalizes a policy document: fills process-wide defaults, the
/// built-in target name, non-null strategy configs, and expands any
/// short-form built-in-metrics-source query. Idempotent:
/// `canonicalize(canonicalize(p)) == canonicalize(p)`.
pub fn canonicalize(mut policy: Policy, defaults: &PolicyDefaults) -> Policy {
    if policy.cooldown.is_zero() && policy.evaluation_interval.is_zero() {
        // both absent is the common "nothing was set" case; treat
        // zero-evaluation-interval on its own as a misconfiguration the
        // source should have already rejected, so only backfill when both
        // are unset.
    }
    if policy.evaluation_interval.is_zero() {
        policy.evaluation_interval = defaults.evaluation_interval;
    }
    // cooldown is legitimately allowed to be zero, so only the "never set"
    // sentinel (also zero, since Duration has no Option-like absent state
    // at the wire level) backfills from defaults. Sources that distinguish
    // "explicit zero" from "absent" are expected to have already resolved
    // that before handing the engine a Policy.

    if policy.min < 0 {
        policy.min = 0;
    }
    if policy.max < policy.min {
        policy.max = policy.min;
    }

    if policy.policy_type == PolicyType::Horizontal && policy.target.name.is_empty() {
        policy.target.name = BUILTIN_TARGET_NAME.to_string();
    }

    for check in &mut policy.checks {
        if check.strategy.name.is_empty() {
            // leave name empty; the plugin manager will surface a dispense
            // error rather than silently guessing a strategy.
        }
        if check.source == BUILTIN_METRICS_SOURCE && !check.query.contains('/') {
            let group = policy
                .target
                .config
                .get("group")
                .cloned()
                .unwrap_or_else(|| "default".to_string());
            let job = policy
                .target
                .config
                .get("job")
                .cloned()
                .unwrap_or_else(|| "default".to_string());
            check.query = format!("{}/{}/{}", check.query, group, job);
        }
    }

    policy
}

/// `{timestamp, value}` sample returned by a metrics source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimestampedMetric {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub value: f64,
}

impl TimestampedMetric {
    pub fn is_finite(&self) -> bool {
        self.value.is_finite()
    }
}

/// A sequence of samples ordered by timestamp ascending; "latest" is the
/// last element.
pub type TimestampedMetrics = Vec<TimestampedMetric>;

/// Sorts metrics by timestamp ascending, as the executor does before handing
/// them to a strategy.
pub fn sort_metrics(mut metrics: TimestampedMetrics) -> TimestampedMetrics {
    metrics.sort_by_key(|m| m.timestamp);
    metrics
}

/// The time range a metrics-source query runs over.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: chrono::DateTime<chrono::Utc>,
    pub to: chrono::DateTime<chrono::Utc>,
}

impl TimeRange {
    /// Builds `[now - (window + offset), now - offset]` per §4.6 step 3.
    pub fn for_check(now: chrono::DateTime<chrono::Utc>, check: &Check) -> Self {
        let offset = chrono::Duration::from_std(check.query_window_offset).unwrap_or_default();
        let window = chrono::Duration::from_std(check.query_window).unwrap_or_default();
        Self {
            from: now - window - offset,
            to: now - offset,
        }
    }
}

/// The target's reported current state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetStatus {
    pub ready: bool,
    pub count: i64,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

/// Key under which a target may report the timestamp of the last
/// out-of-band scaling event, used to compute remaining cooldown.
pub const META_LAST_EVENT: &str = "nomad_autoscaler.last_event";

impl TargetStatus {
    /// Parses the out-of-band last-scaling-event timestamp, if present.
    pub fn last_event(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.meta
            .get(META_LAST_EVENT)
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
    }
}

/// The direction a `ScalingAction` moves the target's count, used as the
/// primary key in preemption (`Up > None > Down`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    None,
    Up,
    Down,
}

impl Direction {
    fn rank(self) -> u8 {
        match self {
            Direction::Up => 2,
            Direction::None => 1,
            Direction::Down => 0,
        }
    }
}

impl Default for Direction {
    fn default() -> Self {
        Direction::None
    }
}

/// Sentinel `count` encoding a dry-run action that must not mutate the
/// target.
pub const DRY_RUN_COUNT: i64 = -1;

/// Meta key under which the intended (pre-dry-run) count is stashed.
pub const META_DRY_RUN_COUNT: &str = "nomad_autoscaler.dry_run_count";

/// Meta key under which `cap_count` records the pre-clamp count.
pub const META_PRE_CAP_COUNT: &str = "nomad_autoscaler.pre_cap_count";

/// Meta key under which `cap_count` appends the pre-clamp reason history.
pub const META_PRE_CAP_REASON_HISTORY: &str = "nomad_autoscaler.pre_cap_reason_history";

/// Bound on how many pre-cap reasons `cap_count` keeps per action.
const PRE_CAP_HISTORY_LIMIT: usize = 10;

/// The outcome of a check or a reduction: a proposed new count, and why.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalingAction {
    pub count: i64,
    pub reason: String,
    pub error: bool,
    pub direction: Direction,
    #[serde(default)]
    pub meta: HashMap<String, serde_json::Value>,
}

impl ScalingAction {
    pub fn none(reason: impl Into<String>) -> Self {
        Self {
            count: 0,
            reason: reason.into(),
            error: false,
            direction: Direction::None,
            meta: HashMap::new(),
        }
    }

    pub fn up(count: i64, reason: impl Into<String>) -> Self {
        Self {
            count,
            reason: reason.into(),
            error: false,
            direction: Direction::Up,
            meta: HashMap::new(),
        }
    }

    pub fn down(count: i64, reason: impl Into<String>) -> Self {
        Self {
            count,
            reason: reason.into(),
            error: false,
            direction: Direction::Down,
            meta: HashMap::new(),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.count == DRY_RUN_COUNT
    }

    /// Mutates the action into its dry-run form: stash the intended count,
    /// set the sentinel.
    pub fn into_dry_run(mut self) -> Self {
        self.meta.insert(
            META_DRY_RUN_COUNT.to_string(),
            serde_json::Value::from(self.count),
        );
        self.count = DRY_RUN_COUNT;
        self
    }

    /// Clamps `count` into `[min, max]`, idempotently. Non-dry-run actions
    /// only: a dry-run action's sentinel count is left untouched.
    pub fn cap_count(mut self, min: i64, max: i64) -> Self {
        if self.is_dry_run() {
            return self;
        }
        if self.count >= min && self.count <= max {
            return self;
        }
        let pre_cap = self.count;
        let capped = self.count.clamp(min, max);
        self.meta
            .insert(META_PRE_CAP_COUNT.to_string(), serde_json::Value::from(pre_cap));
        let mut history: Vec<String> = self
            .meta
            .get(META_PRE_CAP_REASON_HISTORY)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        history.push(self.reason.clone());
        if history.len() > PRE_CAP_HISTORY_LIMIT {
            let overflow = history.len() - PRE_CAP_HISTORY_LIMIT;
            history.drain(0..overflow);
        }
        self.meta.insert(
            META_PRE_CAP_REASON_HISTORY.to_string(),
            serde_json::Value::from(history),
        );
        self.count = capped;
        self
    }

    /// Rewrites the direction to `None` when the proposed count matches the
    /// current count (no real movement, regardless of what the strategy said).
    pub fn canonicalize_noop(mut self, current_count: i64) -> Self {
        if !self.is_dry_run() && self.count == current_count {
            self.direction = Direction::None;
        }
        self
    }
}

/// Preemption-max between two actions: `Up > None > Down`, and within a
/// direction the larger `|count|` wins. Commutative and associative, so the
/// winner of a set is independent of fold order.
pub fn preempt(a: &ScalingAction, b: &ScalingAction) -> ScalingAction {
    let rank_a = a.direction.rank();
    let rank_b = b.direction.rank();
    if rank_a != rank_b {
        return if rank_a > rank_b { a.clone() } else { b.clone() };
    }
    if a.count.abs() >= b.count.abs() {
        a.clone()
    } else {
        b.clone()
    }
}

/// Reduces a set of actions to the single preemption-max winner. Returns
/// `None` for an empty set.
pub fn reduce(actions: impl IntoIterator<Item = ScalingAction>) -> Option<ScalingAction> {
    actions.into_iter().reduce(|a, b| preempt(&a, &b))
}

/// One check paired with the (initially empty) action the strategy fills in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckEvaluation {
    pub check: Check,
    pub action: ScalingAction,
}

/// A single attempt to decide the new count for a policy's target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvaluation {
    pub policy: Policy,
    pub target_status: TargetStatus,
    pub check_evaluations: Vec<CheckEvaluation>,
}

impl ScalingEvaluation {
    /// Builds a fresh evaluation from a policy: one `CheckEvaluation` per
    /// check, each with a canonicalized-empty action.
    pub fn new(policy: Policy, target_status: TargetStatus) -> Self {
        let check_evaluations = policy
            .checks
            .iter()
            .map(|check| CheckEvaluation {
                check: check.clone(),
                action: ScalingAction::default(),
            })
            .collect();
        Self {
            policy,
            target_status,
            check_evaluations,
        }
    }
}

/// Result of grouping check outcomes by `Check::group` and reducing each
/// group (§4.6 step 4): within a named group, `None` actions are ignored
/// unless every member returned `None`.
pub fn reduce_groups(
    results: Vec<(Option<String>, ScalingAction)>,
) -> Vec<ScalingAction> {
    let mut ungrouped = Vec::new();
    let mut grouped: Vec<(String, Vec<ScalingAction>)> = Vec::new();

    for (group, action) in results {
        match group {
            None => ungrouped.push(action),
            Some(name) if name.is_empty() => ungrouped.push(action),
            Some(name) => {
                if let Some((_, members)) = grouped.iter_mut().find(|(g, _)| *g == name) {
                    members.push(action);
                } else {
                    grouped.push((name, vec![action]));
                }
            }
        }
    }

    let mut winners = ungrouped;
    for (_, members) in grouped {
        let all_none = members.iter().all(|a| a.direction == Direction::None);
        let candidates: Vec<ScalingAction> = if all_none {
            // every member agreed on "no action"; keep any one of them.
            members.into_iter().take(1).collect()
        } else {
            members
                .into_iter()
                .filter(|a| a.direction != Direction::None)
                .collect()
        };
        if let Some(winner) = reduce(candidates) {
            winners.push(winner);
        }
    }
    winners
}

/// (de)serializes a `Duration` as whole seconds, matching how the policy
/// wire format expresses `cooldown`/`evaluation_interval`/`query_window`.
mod duration_seconds {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_with(min: i64, max: i64, checks: Vec<Check>) -> Policy {
        Policy {
            id: "p1".into(),
            enabled: true,
            policy_type: PolicyType::Horizontal,
            min,
            max,
            cooldown: Duration::from_secs(0),
            evaluation_interval: Duration::from_secs(0),
            on_check_error: OnError::Fail,
            target: PluginRef::new(""),
            checks,
        }
    }

    fn check(source: &str, query: &str) -> Check {
        Check {
            name: "c".into(),
            source: source.into(),
            query: query.into(),
            query_window: Duration::from_secs(60),
            query_window_offset: Duration::from_secs(0),
            on_error: OnError::Fail,
            group: None,
            strategy: PluginRef::new("target-value"),
        }
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let defaults = PolicyDefaults::default();
        let p = policy_with(1, 10, vec![check(BUILTIN_METRICS_SOURCE, "cpu")]);
        let once = canonicalize(p, &defaults);
        let twice = canonicalize(once.clone(), &defaults);
        assert_eq!(once, twice);
    }

    #[test]
    fn canonicalize_fills_defaults_and_target() {
        let defaults = PolicyDefaults::default();
        let p = policy_with(1, 10, vec![]);
        let canon = canonicalize(p, &defaults);
        assert_eq!(canon.evaluation_interval, defaults.evaluation_interval);
        assert_eq!(canon.target.name, BUILTIN_TARGET_NAME);
    }

    #[test]
    fn canonicalize_expands_short_form_query_once() {
        let defaults = PolicyDefaults::default();
        let mut p = policy_with(1, 10, vec![check(BUILTIN_METRICS_SOURCE, "cpu")]);
        p.target.config.insert("group".into(), "web".into());
        p.target.config.insert("job".into(), "api".into());
        let once = canonicalize(p, &defaults);
        assert_eq!(once.checks[0].query, "cpu/web/api");
        let twice = canonicalize(once.clone(), &defaults);
        assert_eq!(twice.checks[0].query, "cpu/web/api");
    }

    #[test]
    fn cap_count_clamps_and_is_idempotent() {
        let a = ScalingAction::up(20, "scale up");
        let capped = a.cap_count(1, 10);
        assert_eq!(capped.count, 10);
        let twice = capped.clone().cap_count(1, 10);
        assert_eq!(twice.count, 10);
        assert_eq!(twice, capped);
    }

    #[test]
    fn cap_count_leaves_dry_run_sentinel_alone() {
        let a = ScalingAction::up(20, "scale up").into_dry_run();
        let capped = a.clone().cap_count(1, 10);
        assert_eq!(capped.count, DRY_RUN_COUNT);
    }

    #[test]
    fn preempt_prefers_up_over_none_over_down() {
        let up = ScalingAction::up(3, "up");
        let none = ScalingAction::none("none");
        let down = ScalingAction::down(2, "down");
        assert_eq!(preempt(&up, &down), up);
        assert_eq!(preempt(&none, &down), none);
        assert_eq!(preempt(&up, &none), up);
    }

    #[test]
    fn preempt_within_direction_prefers_larger_magnitude() {
        let small = ScalingAction::up(2, "small");
        let large = ScalingAction::up(5, "large");
        assert_eq!(preempt(&small, &large), large);
        assert_eq!(preempt(&large, &small), large);
    }

    #[test]
    fn preempt_is_order_independent_across_a_set() {
        let actions = vec![
            ScalingAction::down(4, "d"),
            ScalingAction::up(2, "u1"),
            ScalingAction::none("n"),
            ScalingAction::up(6, "u2"),
        ];
        let forward = reduce(actions.clone()).unwrap();
        let mut reversed = actions;
        reversed.reverse();
        let backward = reduce(reversed).unwrap();
        assert_eq!(forward, backward);
        assert_eq!(forward.count, 6);
    }

    #[test]
    fn reduce_groups_ignores_none_unless_unanimous() {
        let results = vec![
            (Some("g".to_string()), ScalingAction::none("a")),
            (Some("g".to_string()), ScalingAction::up(3, "b")),
        ];
        let winners = reduce_groups(results);
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].direction, Direction::Up);
    }

    #[test]
    fn reduce_groups_keeps_one_when_all_members_agree_on_none() {
        let results = vec![
            (Some("g".to_string()), ScalingAction::none("a")),
            (Some("g".to_string()), ScalingAction::none("b")),
        ];
        let winners = reduce_groups(results);
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].direction, Direction::None);
    }

    #[test]
    fn canonicalize_noop_rewrites_direction() {
        let action = ScalingAction::up(5, "unchanged").canonicalize_noop(5);
        assert_eq!(action.direction, Direction::None);
    }
}
