//! Condition bookkeeping for Cluster status
//!
//! Conditions are kept sorted with `Ready` first and the rest by type.
//! `lastTransitionTime` only moves when a condition's status flips; setting a
//! condition with the same status keeps the previous timestamp even if the
//! reason or message changed.

use crate::crd::{Cluster, Condition, ConditionSeverity, ConditionStatus};
use crate::Error;

/// Condition types written by the Cluster controller
pub mod types {
    /// Summary of the other owned conditions
    pub const READY: &str = "Ready";
    /// Mirrors the infrastructure provider's Ready condition
    pub const INFRASTRUCTURE_READY: &str = "InfrastructureReady";
    /// Mirrors the control plane provider's Ready condition
    pub const CONTROL_PLANE_READY: &str = "ControlPlaneReady";
}

/// Well-known condition reasons
pub mod reasons {
    /// Infrastructure provider has not reported ready yet
    pub const WAITING_FOR_INFRASTRUCTURE: &str = "WaitingForInfrastructure";
    /// Control plane provider has not reported ready yet
    pub const WAITING_FOR_CONTROL_PLANE: &str = "WaitingForControlPlane";
    /// Provider object is being deleted
    pub const DELETING: &str = "Deleting";
    /// Provider object is gone
    pub const DELETED: &str = "Deleted";
}

/// Condition types whose concurrent modification is resolved in our favour
pub const OWNED_CONDITIONS: &[&str] = &[
    types::READY,
    types::CONTROL_PLANE_READY,
    types::INFRASTRUCTURE_READY,
];

/// Read access to an object's conditions
pub trait Getter {
    /// All conditions on the object
    fn conditions(&self) -> Vec<Condition>;

    /// The condition of the given type, if present
    fn get_condition(&self, type_: &str) -> Option<Condition> {
        self.conditions().into_iter().find(|c| c.type_ == type_)
    }
}

/// Write access to an object's conditions
pub trait Setter {
    /// Mutable condition list
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

impl Getter for Cluster {
    fn conditions(&self) -> Vec<Condition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default()
    }
}

impl Setter for Cluster {
    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status_mut().conditions
    }
}

/// Fallback used by [`mirror`] when the source has no Ready condition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fallback {
    status: ConditionStatus,
    reason: String,
    severity: ConditionSeverity,
}

impl Fallback {
    /// Fallback derived from a readiness flag: True when ready, otherwise
    /// False with the given reason and severity
    pub fn from_ready(ready: bool, reason: &str, severity: ConditionSeverity) -> Self {
        if ready {
            Self {
                status: ConditionStatus::True,
                reason: String::new(),
                severity: ConditionSeverity::None,
            }
        } else {
            Self::status_false(reason, severity)
        }
    }

    /// Always False with the given reason and severity
    pub fn status_false(reason: &str, severity: ConditionSeverity) -> Self {
        Self {
            status: ConditionStatus::False,
            reason: reason.to_string(),
            severity,
        }
    }

    fn into_condition(self, type_: &str) -> Condition {
        Condition {
            severity: self.severity,
            ..Condition::new(type_, self.status, self.reason, "")
        }
    }
}

/// The condition of the given type, if present
pub fn get(from: &impl Getter, type_: &str) -> Option<Condition> {
    from.get_condition(type_)
}

/// Returns true if the condition exists and is True
pub fn is_true(from: &impl Getter, type_: &str) -> bool {
    get(from, type_).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Set a condition, keeping the old transition time if the status is unchanged
pub fn set(to: &mut impl Setter, condition: Condition) {
    set_in(to.conditions_mut(), condition);
}

/// Set the given type to True
pub fn mark_true(to: &mut impl Setter, type_: &str) {
    set(to, Condition::true_condition(type_));
}

/// Set the given type to False with a reason and severity
pub fn mark_false(
    to: &mut impl Setter,
    type_: &str,
    reason: &str,
    severity: ConditionSeverity,
    message: impl Into<String>,
) {
    set(to, Condition::false_condition(type_, reason, severity, message));
}

/// Remove a condition type
pub fn delete(to: &mut impl Setter, type_: &str) {
    to.conditions_mut().retain(|c| c.type_ != type_);
}

/// Reduce the listed condition types to one `Ready` condition.
///
/// The worst status wins. Ordering from worst to best:
/// False/Error, False/Warning, False/Info, False/None, Unknown, True.
/// The summary carries the worst condition's status, severity, reason and
/// message. Returns `None` if none of the listed conditions are present.
pub fn summary(from: &impl Getter, of: &[&str]) -> Option<Condition> {
    let present = from.conditions();
    let worst = present
        .iter()
        .filter(|c| of.contains(&c.type_.as_str()))
        .min_by_key(|c| rank(c))?;

    Some(match worst.status {
        ConditionStatus::True => Condition::true_condition(types::READY),
        _ => Condition {
            severity: worst.severity,
            ..Condition::new(
                types::READY,
                worst.status,
                worst.reason.clone(),
                worst.message.clone(),
            )
        },
    })
}

/// Compute and set the `Ready` summary from the listed condition types
pub fn set_summary<T: Getter + Setter>(to: &mut T, of: &[&str]) {
    if let Some(ready) = summary(&*to, of) {
        set(to, ready);
    }
}

/// Copy the source's `Ready` condition under `target_type`, or synthesize
/// the fallback when the source has no `Ready` condition yet
pub fn mirror(from: &impl Getter, target_type: &str, fallback: Fallback) -> Condition {
    match from.get_condition(types::READY) {
        Some(ready) => Condition {
            type_: target_type.to_string(),
            ..ready
        },
        None => fallback.into_condition(target_type),
    }
}

/// Mirror `from` into `to` under `target_type`
pub fn set_mirror(
    to: &mut impl Setter,
    target_type: &str,
    from: &impl Getter,
    fallback: Fallback,
) {
    set(to, mirror(from, target_type, fallback));
}

/// Three-way merge of condition changes made during a reconcile pass.
///
/// `before` is what the pass started from, `after` what it computed and
/// `latest` what the API server holds now. Every condition the pass changed
/// is applied on top of `latest`. If another writer changed the same
/// condition to something else in the meantime, the change wins for types in
/// `owned` and yields [`Error::ConditionConflict`] for all others.
pub fn merge_changes(
    before: &[Condition],
    after: &[Condition],
    latest: &[Condition],
    owned: &[&str],
) -> Result<Vec<Condition>, Error> {
    let mut merged = latest.to_vec();

    let mut changed: Vec<&str> = after.iter().map(|c| c.type_.as_str()).collect();
    for condition in before {
        if !changed.contains(&condition.type_.as_str()) {
            changed.push(&condition.type_);
        }
    }

    for type_ in changed {
        let b = find(before, type_);
        let a = find(after, type_);
        if same_state(b, a) {
            continue;
        }

        let l = find(latest, type_);
        if !same_state(l, b) && !same_state(l, a) && !owned.contains(&type_) {
            return Err(Error::condition_conflict(type_));
        }

        match a {
            Some(condition) => set_in(&mut merged, condition.clone()),
            None => merged.retain(|c| c.type_ != type_),
        }
    }

    Ok(merged)
}

fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

fn same_state(a: Option<&Condition>, b: Option<&Condition>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.has_same_state(b),
        _ => false,
    }
}

fn rank(condition: &Condition) -> u8 {
    match (condition.status, condition.severity) {
        (ConditionStatus::False, ConditionSeverity::Error) => 0,
        (ConditionStatus::False, ConditionSeverity::Warning) => 1,
        (ConditionStatus::False, ConditionSeverity::Info) => 2,
        (ConditionStatus::False, ConditionSeverity::None) => 3,
        (ConditionStatus::Unknown, _) => 4,
        (ConditionStatus::True, _) => 5,
    }
}

fn set_in(conditions: &mut Vec<Condition>, mut condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time;
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }

    conditions.sort_by(|a, b| {
        let a_ready = a.type_ == types::READY;
        let b_ready = b.type_ == types::READY;
        b_ready.cmp(&a_ready).then_with(|| a.type_.cmp(&b.type_))
    });
}
