//! Helper methods for extracting data from search results.
use ldap3::SearchEntry;

use crate::error::Error;

/// An extension trait for [`SearchEntry`] that provides convenience methods
/// for extracting data.
///
/// Attribute names are compared case-insensitively, since servers answer
/// with schema casing (`memberOf`) while configuration files rarely bother.
pub trait SearchEntryExt {
	/// Get all values of an attribute. Returns an empty slice for an
	/// attribute the entry does not carry.
	fn attr_all(&self, attr: &str) -> &[String];

	/// Get the first value of an attribute. Will return `None` if the
	/// attribute is absent or its value is not valid UTF-8.
	fn attr_first(&self, attr: &str) -> Option<&str> {
		self.attr_all(attr).first().map(String::as_str)
	}

	/// Get the first value of an attribute, in binary form.
	fn bin_attr_first(&self, attr: &str) -> Option<&[u8]>;

	/// Get the first value of an attribute, interpreted as a directory
	/// boolean (`TRUE` or `FALSE`).
	fn bool_first(&self, attr: &str) -> Option<Result<bool, Error>> {
		match self.attr_first(attr) {
			Some("TRUE") => Some(Ok(true)),
			Some("FALSE") => Some(Ok(false)),
			Some(_) => Some(Err(Error::Invalid(attr.to_owned()))),
			None => None,
		}
	}
}

impl SearchEntryExt for SearchEntry {
	fn attr_all(&self, attr: &str) -> &[String] {
		if let Some(values) = self.attrs.get(attr) {
			return values;
		}
		match self.attrs.iter().find(|(key, _)| key.eq_ignore_ascii_case(attr)) {
			Some((_, values)) => values,
			None => &[],
		}
	}

	fn bin_attr_first(&self, attr: &str) -> Option<&[u8]> {
		if let Some(first) = self.attr_first(attr) {
			return Some(first.as_bytes());
		}

		if let Some(values) = self.bin_attrs.get(attr) {
			return values.first().map(Vec::as_slice);
		}
		self.bin_attrs
			.iter()
			.find(|(key, _)| key.eq_ignore_ascii_case(attr))
			.and_then(|(_, values)| values.first().map(Vec::as_slice))
	}
}

#[cfg(test)]
mod tests {
	use ldap3::SearchEntry;

	use super::SearchEntryExt;

	/// An entry with one multi-valued text attribute and one binary one.
	fn entry() -> SearchEntry {
		SearchEntry {
			dn: String::from("uid=foo,ou=People,dc=example,dc=org"),
			attrs: [
				(
					String::from("memberOf"),
					vec![
						String::from("cn=staff,ou=Groups,dc=example,dc=org"),
						String::from("cn=admins,ou=Groups,dc=example,dc=org"),
					],
				),
				(String::from("employeeType"), vec![String::from("TRUE")]),
			]
			.into_iter()
			.collect(),
			bin_attrs: [(String::from("jpegPhoto"), vec![vec![0xff, 0xd8]])].into_iter().collect(),
		}
	}

	#[test]
	fn attr_first_returns_the_first_value() {
		let entry = entry();
		assert_eq!(entry.attr_first("does_not_exist"), None);
		assert_eq!(entry.attr_first("memberOf"), Some("cn=staff,ou=Groups,dc=example,dc=org"));
	}

	#[test]
	fn lookups_ignore_attribute_case() {
		let entry = entry();
		assert_eq!(entry.attr_all("memberof").len(), 2);
		assert_eq!(entry.attr_first("MEMBEROF"), entry.attr_first("memberOf"));
		assert_eq!(entry.bin_attr_first("JPEGPHOTO"), Some(&[0xff, 0xd8][..]));
	}

	#[test]
	fn booleans_follow_the_directory_syntax() {
		let mut entry = entry();
		assert!(matches!(entry.bool_first("employeeType"), Some(Ok(true))));
		assert!(entry.bool_first("does_not_exist").is_none());

		entry
			.attrs
			.insert(String::from("employeeType"), vec![String::from("yes")]);
		assert!(matches!(entry.bool_first("employeeType"), Some(Err(_))));
	}
}
