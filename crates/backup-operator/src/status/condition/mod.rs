pub mod backup_policy;

use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::EnumCount;

/// A **data structure** that contains a vector of `ClusterCondition`s.
/// Usually implemented on the status of a custom resource or the resource itself.
pub trait HasStatusCondition {
    fn conditions(&self) -> Vec<ClusterCondition>;
}

/// A **data structure** that produces a `ClusterConditionSet` containing all required
/// `ClusterCondition`s.
pub trait ConditionBuilder {
    fn build_conditions(&self) -> ClusterConditionSet;
}

/// Computes the final conditions to be set in the status condition field.
///
/// The conditions of all `condition_builders` are merged first: for each condition type the worst
/// status wins, and messages of conditions with equal status are joined. The result is then
/// merged with the conditions currently set on `resource` to compute the update and transition
/// timestamps.
pub fn compute_conditions_at<T: HasStatusCondition>(
    resource: &T,
    condition_builders: &[&dyn ConditionBuilder],
    now: Timestamp,
) -> Vec<ClusterCondition> {
    let mut new_resource_conditions = ClusterConditionSet::new();
    for cb in condition_builders {
        let conditions: ClusterConditionSet = cb.build_conditions();
        new_resource_conditions = new_resource_conditions.merge(conditions, update_message);
    }

    let old_resource_conditions: ClusterConditionSet = resource.conditions().into();

    let mut conditions: Vec<ClusterCondition> = old_resource_conditions
        .merge(new_resource_conditions, |old, new| {
            update_timestamps(old, new, Time(now))
        })
        .into();

    // Conditions seen for the first time have no predecessor to take timestamps from
    for condition in &mut conditions {
        condition.last_transition_time.get_or_insert_with(|| Time(now));
        condition.last_update_time.get_or_insert_with(|| Time(now));
    }

    conditions
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Last time the condition transitioned from one status to another.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,

    /// The last time this condition was updated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,

    /// A human readable message indicating details about the transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// The reason for the condition's last transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Status of the condition, one of True, False, Unknown.
    pub status: ClusterConditionStatus,

    /// Type of the condition.
    #[serde(rename = "type")]
    pub type_: ClusterConditionType,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    EnumCount,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "PascalCase")]
pub enum ClusterConditionType {
    /// The policy is valid and backups are scheduled as configured.
    #[default]
    Ready,

    /// At least one backup job is running.
    Running,

    /// The most recent backup failed.
    Degraded,

    /// New backups are not scheduled because the policy is suspended.
    Suspended,
}

/// Condition status. The variant order defines severity, later variants are worse.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
)]
#[serde(rename_all = "PascalCase")]
pub enum ClusterConditionStatus {
    /// True means a resource is in the condition.
    #[default]
    True,

    /// False means a resource is not in the condition.
    False,

    /// Unknown means it cannot be decided if a resource is in the condition or not.
    Unknown,
}

/// Helper struct to order and merge `ClusterCondition` objects.
#[derive(Clone, Debug)]
pub struct ClusterConditionSet {
    conditions: Vec<Option<ClusterCondition>>,
}

impl Default for ClusterConditionSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterConditionSet {
    pub fn new() -> Self {
        Self {
            // Every condition type has a fixed slot, which keeps the output ordered and makes it
            // impossible to store a condition under another type.
            conditions: vec![None; ClusterConditionType::COUNT],
        }
    }

    /// Adds a [`ClusterCondition`] to its assigned index in the conditions vector.
    fn put(&mut self, condition: ClusterCondition) {
        let index = condition.type_ as usize;
        self.conditions[index] = Some(condition);
    }

    /// Merges two [`ClusterConditionSet`]s. The `condition_combiner` implements the strategy used
    /// to merge two conditions of the same type.
    fn merge(
        self,
        other: Self,
        condition_combiner: impl Fn(ClusterCondition, ClusterCondition) -> ClusterCondition,
    ) -> Self {
        let mut result = Self::new();

        for (old_condition, new_condition) in self.conditions.into_iter().zip(other.conditions) {
            if let Some(condition) = match (old_condition, new_condition) {
                (Some(old), Some(new)) => Some(condition_combiner(old, new)),
                (Some(old), None) => Some(old),
                (None, Some(new)) => Some(new),
                (None, None) => None,
            } {
                result.put(condition);
            }
        }

        result
    }
}

/// A condition combiner strategy where the timestamps are updated to reflect a state transition
/// (if needed).
fn update_timestamps(
    old_condition: ClusterCondition,
    new_condition: ClusterCondition,
    now: Time,
) -> ClusterCondition {
    debug_assert_eq!(old_condition.type_, new_condition.type_);

    if old_condition.status == new_condition.status {
        ClusterCondition {
            last_update_time: Some(now),
            last_transition_time: old_condition.last_transition_time,
            ..new_condition
        }
    } else {
        ClusterCondition {
            last_update_time: Some(now.clone()),
            last_transition_time: Some(now),
            ..new_condition
        }
    }
}

/// A condition combiner strategy with the following properties:
/// 1. It preserves the condition with the worst status.
/// 2. It joins the previous message to the current one if both conditions have the same status.
fn update_message(
    old_condition: ClusterCondition,
    new_condition: ClusterCondition,
) -> ClusterCondition {
    debug_assert_eq!(old_condition.type_, new_condition.type_);

    match old_condition.status.cmp(&new_condition.status) {
        std::cmp::Ordering::Equal => {
            let message = Some(
                [old_condition.message, new_condition.message]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<String>>()
                    .join("\n"),
            );

            ClusterCondition {
                message,
                ..new_condition
            }
        }
        std::cmp::Ordering::Less => new_condition,
        std::cmp::Ordering::Greater => old_condition,
    }
}

impl From<ClusterConditionSet> for Vec<ClusterCondition> {
    fn from(value: ClusterConditionSet) -> Self {
        value.conditions.into_iter().flatten().collect()
    }
}

impl From<Vec<ClusterCondition>> for ClusterConditionSet {
    fn from(value: Vec<ClusterCondition>) -> Self {
        let mut result = Self::new();
        for c in value {
            result.put(c);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    struct OldConditions(Vec<ClusterCondition>);

    impl HasStatusCondition for OldConditions {
        fn conditions(&self) -> Vec<ClusterCondition> {
            self.0.clone()
        }
    }

    struct FixedBuilder(ClusterConditionStatus, &'static str);

    impl ConditionBuilder for FixedBuilder {
        fn build_conditions(&self) -> ClusterConditionSet {
            vec![ready(self.0, self.1)].into()
        }
    }

    fn ready(status: ClusterConditionStatus, message: &str) -> ClusterCondition {
        ClusterCondition {
            type_: ClusterConditionType::Ready,
            status,
            message: Some(message.to_owned()),
            ..ClusterCondition::default()
        }
    }

    fn ts(second: i64) -> Timestamp {
        Timestamp::from_second(second).unwrap()
    }

    #[test]
    fn transition_sets_both_timestamps() {
        let old = OldConditions(vec![ready(ClusterConditionStatus::Unknown, "old")]);

        let got = compute_conditions_at(
            &old,
            &[&FixedBuilder(ClusterConditionStatus::True, "new")],
            ts(100),
        );

        assert_eq!(got.len(), 1);
        assert_eq!(got[0].status, ClusterConditionStatus::True);
        assert_eq!(got[0].message.as_deref(), Some("new"));
        assert_eq!(got[0].last_transition_time, Some(Time(ts(100))));
        assert_eq!(got[0].last_update_time, Some(Time(ts(100))));
    }

    #[test]
    fn unchanged_status_keeps_transition_time() {
        let old = OldConditions(vec![ClusterCondition {
            last_transition_time: Some(Time(ts(10))),
            last_update_time: Some(Time(ts(10))),
            ..ready(ClusterConditionStatus::True, "old")
        }]);

        let got = compute_conditions_at(
            &old,
            &[&FixedBuilder(ClusterConditionStatus::True, "still fine")],
            ts(100),
        );

        assert_eq!(got[0].last_transition_time, Some(Time(ts(10))));
        assert_eq!(got[0].last_update_time, Some(Time(ts(100))));
        assert_eq!(got[0].message.as_deref(), Some("still fine"));
    }

    #[test]
    fn new_condition_type_gets_timestamps() {
        let old = OldConditions(vec![]);

        let got = compute_conditions_at(
            &old,
            &[&FixedBuilder(ClusterConditionStatus::False, "new")],
            ts(5),
        );

        assert_eq!(got[0].status, ClusterConditionStatus::False);
        assert_eq!(got[0].last_transition_time, Some(Time(ts(5))));
        assert_eq!(got[0].last_update_time, Some(Time(ts(5))));
    }

    #[rstest]
    #[case::true_false(ClusterConditionStatus::True, ClusterConditionStatus::False, ClusterConditionStatus::False, "b")]
    #[case::false_true(ClusterConditionStatus::False, ClusterConditionStatus::True, ClusterConditionStatus::False, "a")]
    #[case::unknown_wins(ClusterConditionStatus::Unknown, ClusterConditionStatus::False, ClusterConditionStatus::Unknown, "a")]
    #[case::equal_joins(ClusterConditionStatus::True, ClusterConditionStatus::True, ClusterConditionStatus::True, "a\nb")]
    fn worst_status_wins(
        #[case] first: ClusterConditionStatus,
        #[case] second: ClusterConditionStatus,
        #[case] expected_status: ClusterConditionStatus,
        #[case] expected_message: &str,
    ) {
        let old = OldConditions(vec![]);

        let got = compute_conditions_at(
            &old,
            &[&FixedBuilder(first, "a"), &FixedBuilder(second, "b")],
            ts(1),
        );

        assert_eq!(got[0].status, expected_status);
        assert_eq!(got[0].message.as_deref(), Some(expected_message));
    }

    #[test]
    fn conditions_are_ordered_by_type() {
        let set: ClusterConditionSet = vec![
            ClusterCondition {
                type_: ClusterConditionType::Suspended,
                ..ClusterCondition::default()
            },
            ClusterCondition {
                type_: ClusterConditionType::Ready,
                ..ClusterCondition::default()
            },
        ]
        .into();

        let types: Vec<_> = Vec::<ClusterCondition>::from(set)
            .into_iter()
            .map(|c| c.type_)
            .collect();
        assert_eq!(types, [
            ClusterConditionType::Ready,
            ClusterConditionType::Suspended
        ]);
    }
}
