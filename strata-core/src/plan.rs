//! Plans: the diff between a deployed stack and a pending change set.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::manager::StackInfo;
use crate::remote::ChangeSetData;

/// A change between two string values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffString {
    old: String,
    new: String,
}

impl DiffString {
    pub fn new(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self { old: old.into(), new: new.into() }
    }

    /// Whether both sides are equal.
    pub fn is_equal(&self) -> bool {
        self.old == self.new
    }
}

impl std::fmt::Display for DiffString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_equal() {
            write!(f, "{:?}", self.old)
        } else {
            write!(f, "{:?} => {:?}", self.old, self.new)
        }
    }
}

/// A map of string diffs, keyed by parameter name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffStringMap(pub BTreeMap<String, DiffString>);

impl DiffStringMap {
    /// Build a diff map from the old and new value maps. Keys present on
    /// only one side diff against the empty string.
    pub fn new(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> Self {
        let mut diffs: BTreeMap<String, DiffString> = BTreeMap::new();
        for (key, value) in old {
            diffs.insert(key.clone(), DiffString::new(value.clone(), String::new()));
        }
        for (key, value) in new {
            diffs
                .entry(key.clone())
                .and_modify(|d| d.new = value.clone())
                .or_insert_with(|| DiffString::new(String::new(), value.clone()));
        }
        Self(diffs)
    }

    /// Whether any entry changed.
    pub fn has_change(&self) -> bool {
        self.0.values().any(|d| !d.is_equal())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &DiffString)> {
        self.0.iter()
    }

    pub fn get(&self, key: &str) -> Option<&DiffString> {
        self.0.get(key)
    }
}

/// The plan of changes for one stack.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// Stripped change-set identifier (the part after `changeSet/`).
    #[serde(rename = "ID")]
    pub id: String,
    pub change_set: ChangeSetData,
    pub stack: StackInfo,

    #[serde(rename = "RoleARN")]
    pub role_arn: DiffString,
    pub parameters: DiffStringMap,
    pub has_change: bool,
}

impl Plan {
    /// Build a plan from a change-set snapshot and the stack's current
    /// state.
    pub fn new(
        change_set: ChangeSetData,
        stack: StackInfo,
        ignore_nested_updates: bool,
    ) -> Result<Plan> {
        let id = plan_id(&change_set.id)?;
        let role_arn =
            DiffString::new(stack.data.role_arn.clone(), change_set.stack_data.role_arn.clone());
        let parameters =
            DiffStringMap::new(&stack.data.parameters, &change_set.stack_data.parameters);

        let has_change = if ignore_nested_updates {
            // Changes that only carry the automatic nested-stack update
            // marker are considered no-ops; nested stacks can only really
            // change when parameters or the template change.
            change_set.changes.iter().any(|c| !is_nested_auto_update(c))
        } else {
            parameters.has_change() || !change_set.changes.is_empty()
        };

        Ok(Plan { id, change_set, stack, role_arn, parameters, has_change })
    }
}

/// Extract the plan id from a fully qualified change-set identifier:
/// `arn:...:changeSet/<name>/<uuid>` becomes `<name>/<uuid>`.
fn plan_id(change_set_id: &str) -> Result<String> {
    let parts: Vec<&str> = change_set_id.splitn(6, ':').collect();
    if parts.len() != 6 || parts[0] != "arn" {
        return Err(Error::other(format!("cannot parse change set id '{change_set_id}'")));
    }
    let resource = parts[5];
    Ok(resource.strip_prefix("changeSet/").unwrap_or(resource).to_string())
}

fn is_nested_auto_update(change: &crate::remote::ResourceChange) -> bool {
    if change.details.len() != 1 {
        return false;
    }
    let detail = &change.details[0];
    detail.change_source == "Automatic"
        && detail.evaluation == "Dynamic"
        && detail.target.attribute == "Properties"
        && detail.target.requires_recreation == "Never"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{ChangeDetail, ChangeTarget, ResourceChange, StackData};

    fn params(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn change_set(id: &str) -> ChangeSetData {
        ChangeSetData { id: id.to_string(), ..Default::default() }
    }

    fn stack_info(parameters: BTreeMap<String, String>) -> StackInfo {
        StackInfo {
            config_name: "app".into(),
            data: StackData { name: "demo-app".into(), parameters, ..Default::default() },
        }
    }

    fn nested_auto_change() -> ResourceChange {
        ResourceChange {
            action: "Modify".into(),
            resource_type: "AWS::CloudFormation::Stack".into(),
            details: vec![ChangeDetail {
                change_source: "Automatic".into(),
                evaluation: "Dynamic".into(),
                target: ChangeTarget {
                    attribute: "Properties".into(),
                    requires_recreation: "Never".into(),
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    const CS_ARN: &str = "arn:aws:cloudformation:eu-central-1:123456789012:changeSet/demo-cs/abc";

    #[test]
    fn test_diff_string_display() {
        assert_eq!(DiffString::new("a", "a").to_string(), "\"a\"");
        assert_eq!(DiffString::new("y", "x").to_string(), "\"y\" => \"x\"");
        assert!(DiffString::new("a", "a").is_equal());
        assert!(!DiffString::new("a", "b").is_equal());
    }

    #[test]
    fn test_diff_map_tracks_added_and_removed_keys() {
        let diffs =
            DiffStringMap::new(&params(&[("keep", "1"), ("old", "x")]), &params(&[("keep", "1"), ("new", "y")]));
        assert!(diffs.has_change());
        assert_eq!(diffs.get("old").unwrap().to_string(), "\"x\" => \"\"");
        assert_eq!(diffs.get("new").unwrap().to_string(), "\"\" => \"y\"");
        assert!(diffs.get("keep").unwrap().is_equal());
    }

    #[test]
    fn test_plan_id_strips_prefix() {
        assert_eq!(plan_id(CS_ARN).unwrap(), "demo-cs/abc");
        assert!(plan_id("not-an-arn").is_err());
    }

    #[test]
    fn test_parameter_diff_sets_has_change() {
        let mut cs = change_set(CS_ARN);
        cs.stack_data.parameters = params(&[("p", "x")]);
        let plan = Plan::new(cs, stack_info(params(&[("p", "y")])), false).unwrap();
        assert!(plan.has_change);
        assert_eq!(plan.parameters.get("p").unwrap().to_string(), "\"y\" => \"x\"");
    }

    #[test]
    fn test_no_changes_means_no_change() {
        let mut cs = change_set(CS_ARN);
        cs.stack_data.parameters = params(&[("p", "x")]);
        let plan = Plan::new(cs, stack_info(params(&[("p", "x")])), false).unwrap();
        assert!(!plan.has_change);
    }

    #[test]
    fn test_resource_changes_set_has_change() {
        let mut cs = change_set(CS_ARN);
        cs.changes.push(ResourceChange { action: "Add".into(), ..Default::default() });
        let plan = Plan::new(cs, stack_info(params(&[])), false).unwrap();
        assert!(plan.has_change);
    }

    #[test]
    fn test_nested_filter_suppresses_auto_updates() {
        let mut cs = change_set(CS_ARN);
        for _ in 0..4 {
            cs.changes.push(nested_auto_change());
        }
        let plan = Plan::new(cs.clone(), stack_info(params(&[])), true).unwrap();
        assert!(!plan.has_change);

        // Any change that doesn't match the marker flips the plan.
        cs.changes.push(ResourceChange { action: "Add".into(), ..Default::default() });
        let plan = Plan::new(cs, stack_info(params(&[])), true).unwrap();
        assert!(plan.has_change);
    }

    #[test]
    fn test_nested_filter_checks_detail_count() {
        let mut change = nested_auto_change();
        change.details.push(change.details[0].clone());
        let mut cs = change_set(CS_ARN);
        cs.changes.push(change);
        let plan = Plan::new(cs, stack_info(params(&[])), true).unwrap();
        assert!(plan.has_change);
    }
}
