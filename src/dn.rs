//! Distinguished name handling.
//!
//! Directory servers format the same DN in many equivalent spellings, so
//! comparisons here never operate on raw strings. A [`Dn`] is exploded into
//! its relative components at parse time; equality and prefix checks compare
//! components case-insensitively and strictly left-to-right, leaf first:
//! `cn=a,ou=b` and `ou=b,cn=a` are different names.

use std::{fmt, str::FromStr};

use crate::error::Error;

/// Characters that must be escaped when printing an attribute value.
const ESCAPED: [char; 9] = ['#', ',', ';', '=', '+', '<', '>', '"', '\\'];

/// A distinguished name, exploded into relative components.
///
/// The leaf component comes first, as written on the wire.
#[derive(Debug, Clone, Eq)]
pub struct Dn {
	/// The relative components, leaf first.
	components: Vec<Rdn>,
}

/// A single relative component of a [`Dn`], i.e. one `attribute=value` pair.
#[derive(Debug, Clone, Eq)]
pub struct Rdn {
	/// The attribute type, e.g. `cn`.
	attribute: String,
	/// The attribute value, unescaped.
	value: String,
}

impl Rdn {
	/// The attribute type of this component.
	#[must_use]
	pub fn attribute(&self) -> &str {
		&self.attribute
	}

	/// The unescaped value of this component.
	#[must_use]
	pub fn value(&self) -> &str {
		&self.value
	}
}

impl PartialEq for Rdn {
	fn eq(&self, other: &Self) -> bool {
		self.attribute.eq_ignore_ascii_case(&other.attribute)
			&& self.value.eq_ignore_ascii_case(&other.value)
	}
}

impl Dn {
	/// The relative components, leaf first.
	#[must_use]
	pub fn components(&self) -> &[Rdn] {
		&self.components
	}

	/// Number of relative components.
	#[must_use]
	pub fn len(&self) -> usize {
		self.components.len()
	}

	/// Whether this name has no components.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.components.is_empty()
	}

	/// Whether the leading components of this name equal `prefix`, compared
	/// case-insensitively and left-to-right.
	///
	/// This is the comparison group mapping rules use: a rule naming
	/// `cn=staff,ou=groups` matches `cn=staff,ou=groups,dc=example` because
	/// its components sit at the front in the same order, but it does not
	/// match `cn=other,ou=groups,dc=example`.
	#[must_use]
	pub fn starts_with(&self, prefix: &Dn) -> bool {
		if prefix.components.len() > self.components.len() {
			return false;
		}
		self.components.iter().zip(prefix.components.iter()).all(|(a, b)| a == b)
	}

	/// The name with the leaf component removed. The empty name is its own
	/// parent.
	#[must_use]
	pub fn parent(&self) -> Dn {
		Dn { components: self.components.iter().skip(1).cloned().collect() }
	}
}

impl PartialEq for Dn {
	fn eq(&self, other: &Self) -> bool {
		self.components.len() == other.components.len() && self.starts_with(other)
	}
}

impl FromStr for Dn {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.trim().is_empty() {
			return Err(Error::Dn("empty name".to_owned()));
		}
		split_unescaped(s, ',')?
			.into_iter()
			.map(|part| parse_rdn(&part))
			.collect::<Result<Vec<_>, _>>()
			.map(|components| Dn { components })
	}
}

impl fmt::Display for Dn {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for (idx, rdn) in self.components.iter().enumerate() {
			if idx > 0 {
				f.write_str(",")?;
			}
			write!(f, "{rdn}")?;
		}
		Ok(())
	}
}

impl fmt::Display for Rdn {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}=", self.attribute.to_ascii_lowercase())?;
		let lowered = self.value.to_ascii_lowercase();
		let last = lowered.chars().count().saturating_sub(1);
		for (idx, c) in lowered.chars().enumerate() {
			if c == ' ' && (idx == 0 || idx == last) {
				write!(f, "\\ ")?;
			} else if (c as u32) < 0x20 {
				write!(f, "\\{:02x}", c as u32)?;
			} else if ESCAPED.contains(&c) {
				write!(f, "\\{c}")?;
			} else {
				write!(f, "{c}")?;
			}
		}
		Ok(())
	}
}

/// Split `s` on every occurrence of `sep` that is not protected by a
/// backslash escape, unescaping each piece as it goes.
fn split_unescaped(s: &str, sep: char) -> Result<Vec<String>, Error> {
	let mut parts = Vec::new();
	let mut current = String::new();
	let mut chars = s.chars();
	while let Some(c) = chars.next() {
		if c == '\\' {
			current.push(unescape(&mut chars, s)?);
		} else if c == sep {
			parts.push(current);
			current = String::new();
		} else {
			current.push(c);
		}
	}
	parts.push(current);
	Ok(parts)
}

/// Decode the character following a backslash: either a literal special
/// character or a two-digit hex escape.
fn unescape(chars: &mut std::str::Chars<'_>, whole: &str) -> Result<char, Error> {
	let Some(first) = chars.next() else {
		return Err(Error::Dn(format!("dangling escape in {whole:?}")));
	};
	if first.is_ascii_hexdigit() {
		// Hex pairs encode a raw byte; values above 0x7f are not valid
		// UTF-8 on their own and are refused rather than guessed at.
		let Some(second) = chars.next() else {
			return Err(Error::Dn(format!("truncated hex escape in {whole:?}")));
		};
		let hex: String = [first, second].iter().collect();
		let byte = u8::from_str_radix(&hex, 16)
			.map_err(|_| Error::Dn(format!("bad hex escape \\{hex} in {whole:?}")))?;
		if byte >= 0x80 {
			return Err(Error::Dn(format!("non-ASCII hex escape \\{hex} in {whole:?}")));
		}
		Ok(byte as char)
	} else {
		Ok(first)
	}
}

/// Parse one `attribute=value` component, trimming insignificant whitespace
/// around the separator.
fn parse_rdn(part: &str) -> Result<Rdn, Error> {
	let Some((attribute, value)) = part.split_once('=') else {
		return Err(Error::Dn(format!("component {part:?} has no '='")));
	};
	let attribute = attribute.trim();
	let value = value.trim();
	if attribute.is_empty() || value.is_empty() {
		return Err(Error::Dn(format!("component {part:?} is incomplete")));
	}
	Ok(Rdn { attribute: attribute.to_owned(), value: value.to_owned() })
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::str::FromStr;

	use super::Dn;

	#[test]
	fn explode_and_print() {
		let dn = Dn::from_str("CN=Jo Smith, OU=People,DC=Example,DC=org").unwrap();
		assert_eq!(dn.len(), 4);
		assert_eq!(dn.components()[0].attribute(), "CN");
		assert_eq!(dn.components()[0].value(), "Jo Smith");
		assert_eq!(dn.to_string(), "cn=jo smith,ou=people,dc=example,dc=org");
	}

	#[test]
	fn escapes_survive_the_round_trip() {
		let dn = Dn::from_str(r"cn=Smith\, Jo,ou=R\3dD,dc=example").unwrap();
		assert_eq!(dn.components()[0].value(), "Smith, Jo");
		assert_eq!(dn.components()[1].value(), "R=D");
		assert_eq!(dn.to_string(), r"cn=smith\, jo,ou=r\=d,dc=example");
	}

	#[test]
	fn comparison_ignores_case_and_spacing() {
		let a = Dn::from_str("cn=jo,ou=people,dc=example").unwrap();
		let b = Dn::from_str("CN=Jo, OU=People, DC=Example").unwrap();
		assert_eq!(a, b);
	}

	#[test]
	fn comparison_is_order_sensitive() {
		let a = Dn::from_str("cn=a,ou=b").unwrap();
		let b = Dn::from_str("ou=b,cn=a").unwrap();
		assert_ne!(a, b);
	}

	#[test]
	fn prefix_match_walks_left_to_right() {
		let group = Dn::from_str("cn=admins,ou=groups,dc=example,dc=org").unwrap();
		let rule = Dn::from_str("CN=Admins,OU=Groups").unwrap();
		let wrong_order = Dn::from_str("ou=groups,cn=admins").unwrap();
		let longer = Dn::from_str("cn=admins,ou=groups,dc=example,dc=org,o=extra").unwrap();
		assert!(group.starts_with(&rule));
		assert!(!group.starts_with(&wrong_order));
		assert!(!group.starts_with(&longer));
	}

	#[test]
	fn malformed_names_are_rejected() {
		assert!(Dn::from_str("").is_err());
		assert!(Dn::from_str("   ").is_err());
		assert!(Dn::from_str("people").is_err());
		assert!(Dn::from_str("ou=").is_err());
		assert!(Dn::from_str(r"cn=trailing\").is_err());
		assert!(Dn::from_str(r"cn=bad\2").is_err());
	}

	#[test]
	fn parent_drops_the_leaf() {
		let dn = Dn::from_str("cn=jo,ou=people,dc=example").unwrap();
		assert_eq!(dn.parent(), Dn::from_str("ou=people,dc=example").unwrap());
	}
}
