//! Search filter templates and escaping.
//!
//! Usernames are caller-supplied and are always escaped before they are
//! substituted into a filter or a DN template, so a login of `*)(uid=*`
//! cannot widen a search.

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Placeholder replaced by the (escaped) login name in query templates.
pub const USERNAME_TOKEN: &str = "[username]";

/// Placeholder replaced by the user's DN in group search filter templates.
pub const DN_TOKEN: &str = "[dn]";

/// Escape a value for interpolation into a search filter (RFC 4515).
#[must_use]
pub fn escape_value(value: &str) -> String {
	value
		.replace('\\', "\\5c")
		.replace('*', "\\2a")
		.replace('(', "\\28")
		.replace(')', "\\29")
		.replace('\0', "\\00")
}

/// Escape a value for interpolation into a distinguished name (RFC 4514).
#[must_use]
pub fn escape_dn_value(value: &str) -> String {
	let mut out = String::with_capacity(value.len());
	let last = value.chars().count().saturating_sub(1);
	for (idx, c) in value.chars().enumerate() {
		match c {
			' ' if idx == 0 || idx == last => out.push_str("\\ "),
			'#' if idx == 0 => out.push_str("\\#"),
			'"' | '+' | ',' | ';' | '<' | '=' | '>' | '\\' => {
				out.push('\\');
				out.push(c);
			}
			'\0' => out.push_str("\\00"),
			_ => out.push(c),
		}
	}
	out
}

/// Replace every occurrence of `token` in `template` with `value`.
///
/// The value must already be escaped for the template's context.
#[must_use]
pub fn substitute(template: &str, token: &str, value: &str) -> String {
	template.replace(token, value)
}

/// Conjoin two filters with `&`, parenthesizing bare terms.
#[must_use]
pub fn and(base: &str, extra: &str) -> String {
	/// Wrap a bare term in parentheses.
	fn wrap(s: &str) -> String {
		if s.starts_with('(') {
			s.to_owned()
		} else {
			format!("({s})")
		}
	}
	format!("(&{}{})", wrap(base), wrap(extra))
}

/// How a username is turned into a directory entry.
///
/// A template starting with `(` is a search filter and resolution goes
/// through a proxy-bound subtree search; anything else is read as a DN
/// template and the entry DN is built by direct substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserQuery {
	/// Search filter template, e.g. `(uid=[username])`.
	Filter(String),
	/// DN template, e.g. `uid=[username],ou=People,dc=example,dc=org`.
	DnTemplate(String),
}

impl UserQuery {
	/// Parse and classify a query template.
	pub fn parse(template: &str) -> Result<Self, Error> {
		let template = template.trim();
		if !template.contains(USERNAME_TOKEN) {
			return Err(Error::Config(format!(
				"user query {template:?} lacks the {USERNAME_TOKEN} placeholder"
			)));
		}
		if template.starts_with('(') {
			Ok(UserQuery::Filter(template.to_owned()))
		} else {
			Ok(UserQuery::DnTemplate(template.to_owned()))
		}
	}

	/// The raw template string.
	#[must_use]
	pub fn template(&self) -> &str {
		match self {
			UserQuery::Filter(template) | UserQuery::DnTemplate(template) => template,
		}
	}
}

impl fmt::Display for UserQuery {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.template())
	}
}

impl Serialize for UserQuery {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.template())
	}
}

impl<'de> Deserialize<'de> for UserQuery {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let raw = String::deserialize(deserializer)?;
		UserQuery::parse(&raw).map_err(de::Error::custom)
	}
}
