//! Mapping of directory groups onto local roles.
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dn::Dn;

/// One group-to-role mapping rule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MappingRule {
	/// Distinguished name of the directory group.
	pub group: String,
	/// Roles granted to members of that group.
	pub roles: Vec<String>,
}

/// How a rule's group is compared against a membership value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
	/// Case-insensitive string equality of the whole name.
	Exact,
	/// Component-wise comparison of parsed names: a rule matches when its
	/// components equal the leading components of the membership value, so
	/// spacing around separators does not matter and a rule may leave off
	/// the base DN. Falls back to [`MatchMode::Exact`] for values that do
	/// not parse as a DN.
	#[default]
	Components,
}

/// Applies a rule set to the groups collected for a user.
#[derive(Clone, Debug)]
pub struct GroupMapper {
	/// The comparison mode for every rule.
	mode: MatchMode,
	/// The rules, checked in order.
	rules: Vec<MappingRule>,
}

impl GroupMapper {
	/// Create a mapper from configured rules.
	#[must_use]
	pub fn new(mode: MatchMode, rules: Vec<MappingRule>) -> Self {
		GroupMapper { mode, rules }
	}

	/// Collect the roles granted by `groups`, in rule order and without
	/// duplicates.
	#[must_use]
	pub fn roles_for(&self, groups: &[String]) -> Vec<String> {
		let mut roles: Vec<String> = Vec::new();
		for rule in &self.rules {
			if groups.iter().any(|group| self.matches(&rule.group, group)) {
				for role in &rule.roles {
					if !roles.iter().any(|seen| seen == role) {
						roles.push(role.clone());
					}
				}
			}
		}
		roles
	}

	/// Compare one rule group against one membership value.
	fn matches(&self, rule_group: &str, group: &str) -> bool {
		match self.mode {
			MatchMode::Exact => rule_group.eq_ignore_ascii_case(group),
			MatchMode::Components => match (Dn::from_str(rule_group), Dn::from_str(group)) {
				(Ok(rule_dn), Ok(group_dn)) => group_dn.starts_with(&rule_dn),
				_ => {
					warn!("unparseable group name, falling back to exact comparison");
					rule_group.eq_ignore_ascii_case(group)
				}
			},
		}
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use super::{GroupMapper, MappingRule, MatchMode};

	/// Rule set used by most cases.
	fn rules() -> Vec<MappingRule> {
		vec![
			MappingRule {
				group: "cn=admins,ou=Groups,dc=example,dc=org".to_owned(),
				roles: vec!["admin".to_owned(), "staff".to_owned()],
			},
			MappingRule {
				group: "cn=staff,ou=Groups,dc=example,dc=org".to_owned(),
				roles: vec!["staff".to_owned()],
			},
		]
	}

	#[test]
	fn roles_are_collected_in_rule_order() {
		let mapper = GroupMapper::new(MatchMode::Components, rules());
		let groups = vec![
			"cn=staff,ou=groups,dc=example,dc=org".to_owned(),
			"cn=admins,ou=groups,dc=example,dc=org".to_owned(),
		];
		assert_eq!(mapper.roles_for(&groups), ["admin", "staff"]);
	}

	#[test]
	fn component_mode_ignores_spacing_and_case() {
		let mapper = GroupMapper::new(MatchMode::Components, rules());
		let groups = vec!["CN=Admins, OU=Groups, DC=Example, DC=Org".to_owned()];
		assert_eq!(mapper.roles_for(&groups), ["admin", "staff"]);
	}

	#[test]
	fn component_mode_rules_may_leave_off_the_base() {
		let rules = vec![MappingRule {
			group: "cn=staff,ou=Groups".to_owned(),
			roles: vec!["staff".to_owned()],
		}];
		let mapper = GroupMapper::new(MatchMode::Components, rules);
		assert_eq!(
			mapper.roles_for(&["cn=staff,ou=Groups,dc=example,dc=org".to_owned()]),
			["staff"]
		);
		// The leaf has to line up, a bare subtree is not a membership.
		assert!(mapper.roles_for(&["cn=other,ou=Groups,dc=example,dc=org".to_owned()]).is_empty());
	}

	#[test]
	fn exact_mode_is_strict_about_spacing() {
		let mapper = GroupMapper::new(MatchMode::Exact, rules());
		assert!(mapper
			.roles_for(&["cn=admins, ou=Groups, dc=example, dc=org".to_owned()])
			.is_empty());
		assert_eq!(
			mapper.roles_for(&["CN=ADMINS,OU=GROUPS,DC=EXAMPLE,DC=ORG".to_owned()]),
			["admin", "staff"]
		);
	}

	#[test]
	fn unmatched_groups_grant_nothing() {
		let mapper = GroupMapper::new(MatchMode::Components, rules());
		assert!(mapper.roles_for(&["cn=guests,ou=Groups,dc=example,dc=org".to_owned()]).is_empty());
		assert!(mapper.roles_for(&[]).is_empty());
	}
}
