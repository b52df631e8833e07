//! Single sign-on detection from web-server variables.
//!
//! A front-end web server that already authenticated the client (Kerberos,
//! SPNEGO, client certificates) exposes the login name in a request
//! variable, typically `REMOTE_USER`. [`SsoConfig::detect`] decides whether
//! that name may be trusted for the requesting client address and returns
//! it in a form suitable for a directory lookup.
use std::{
	collections::HashMap,
	fmt,
	net::{IpAddr, Ipv4Addr},
	str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::error::Error;

/// An address pattern a client address is checked against.
///
/// Four shapes are accepted, mirroring what front-end servers commonly
/// allow in access rules:
///
/// * a single address: `192.168.1.40` or `2001:db8::1`
/// * an octet wildcard: `192.168.1.*`
/// * a CIDR block: `10.0.0.0/8` or `2001:db8::/32`
/// * an inclusive range: `192.168.1.10-192.168.1.50`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IpRule {
	/// Exactly one address.
	Single(IpAddr),
	/// IPv4 octets, `None` standing for `*`.
	Wildcard([Option<u8>; 4]),
	/// A network and prefix length.
	Cidr(IpAddr, u8),
	/// An inclusive IPv4 range.
	Range(Ipv4Addr, Ipv4Addr),
}

impl IpRule {
	/// Whether `addr` falls under this rule.
	#[must_use]
	pub fn matches(&self, addr: IpAddr) -> bool {
		match (self, addr) {
			(IpRule::Single(rule), addr) => *rule == addr,
			(IpRule::Wildcard(octets), IpAddr::V4(v4)) => octets
				.iter()
				.zip(v4.octets())
				.all(|(rule, octet)| rule.map_or(true, |rule| rule == octet)),
			(IpRule::Cidr(IpAddr::V4(net), prefix), IpAddr::V4(v4)) => {
				let mask = prefix_mask_v4(*prefix);
				u32::from(*net) & mask == u32::from(v4) & mask
			}
			(IpRule::Cidr(IpAddr::V6(net), prefix), IpAddr::V6(v6)) => {
				let mask = prefix_mask_v6(*prefix);
				u128::from(*net) & mask == u128::from(v6) & mask
			}
			(IpRule::Range(start, end), IpAddr::V4(v4)) => {
				let addr = u32::from(v4);
				u32::from(*start) <= addr && addr <= u32::from(*end)
			}
			_ => false,
		}
	}
}

/// The IPv4 network mask for a prefix length.
fn prefix_mask_v4(prefix: u8) -> u32 {
	if prefix == 0 {
		0
	} else {
		u32::MAX << (32_u8.saturating_sub(prefix))
	}
}

/// The IPv6 network mask for a prefix length.
fn prefix_mask_v6(prefix: u8) -> u128 {
	if prefix == 0 {
		0
	} else {
		u128::MAX << (128_u8.saturating_sub(prefix))
	}
}

impl FromStr for IpRule {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if let Some((net, prefix)) = s.split_once('/') {
			let net: IpAddr =
				net.parse().map_err(|_| Error::Rule(format!("bad network in {s:?}")))?;
			let prefix: u8 =
				prefix.parse().map_err(|_| Error::Rule(format!("bad prefix in {s:?}")))?;
			let max = match net {
				IpAddr::V4(_) => 32,
				IpAddr::V6(_) => 128,
			};
			if prefix > max {
				return Err(Error::Rule(format!("prefix /{prefix} too long in {s:?}")));
			}
			return Ok(IpRule::Cidr(net, prefix));
		}
		if s.contains('*') {
			let mut octets = [None; 4];
			let parts: Vec<&str> = s.split('.').collect();
			if parts.len() != 4 {
				return Err(Error::Rule(format!("wildcard {s:?} must have four octets")));
			}
			for (slot, part) in octets.iter_mut().zip(parts) {
				if part != "*" {
					*slot = Some(
						part.parse::<u8>()
							.map_err(|_| Error::Rule(format!("bad octet {part:?} in {s:?}")))?,
					);
				}
			}
			return Ok(IpRule::Wildcard(octets));
		}
		if let Some((start, end)) = s.split_once('-') {
			let start: Ipv4Addr =
				start.trim().parse().map_err(|_| Error::Rule(format!("bad range start in {s:?}")))?;
			let end: Ipv4Addr =
				end.trim().parse().map_err(|_| Error::Rule(format!("bad range end in {s:?}")))?;
			if u32::from(start) > u32::from(end) {
				return Err(Error::Rule(format!("range {s:?} runs backwards")));
			}
			return Ok(IpRule::Range(start, end));
		}
		let addr: IpAddr = s.parse().map_err(|_| Error::Rule(format!("bad address {s:?}")))?;
		Ok(IpRule::Single(addr))
	}
}

impl fmt::Display for IpRule {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			IpRule::Single(addr) => write!(f, "{addr}"),
			IpRule::Wildcard(octets) => {
				let mut first = true;
				for octet in octets {
					if !first {
						write!(f, ".")?;
					}
					first = false;
					match octet {
						Some(octet) => write!(f, "{octet}")?,
						None => write!(f, "*")?,
					}
				}
				Ok(())
			}
			IpRule::Cidr(net, prefix) => write!(f, "{net}/{prefix}"),
			IpRule::Range(start, end) => write!(f, "{start}-{end}"),
		}
	}
}

impl Serialize for IpRule {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for IpRule {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let raw = String::deserialize(deserializer)?;
		raw.parse().map_err(de::Error::custom)
	}
}

/// Whether matching a rule admits or blocks a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMode {
	/// Only clients matching a rule may use SSO.
	AllowListed,
	/// Clients matching a rule may not use SSO.
	DenyListed,
}

/// Address rules restricting which clients may use SSO.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SsoRules {
	/// Whether the list admits or blocks.
	pub mode: RuleMode,
	/// The address patterns.
	pub addresses: Vec<IpRule>,
}

impl SsoRules {
	/// Whether `addr` is permitted under these rules.
	#[must_use]
	pub fn permits(&self, addr: IpAddr) -> bool {
		let matched = self.addresses.iter().any(|rule| rule.matches(addr));
		match self.mode {
			RuleMode::AllowListed => matched,
			RuleMode::DenyListed => !matched,
		}
	}
}

/// Single sign-on configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SsoConfig {
	/// Address rules; when absent every client is eligible.
	#[serde(default)]
	pub rules: Option<SsoRules>,
	/// The request variable carrying the authenticated name.
	#[serde(default = "default_variable")]
	pub variable: String,
	/// Strip `DOMAIN\name` and `name@domain` decorations from the value.
	#[serde(default)]
	pub strip_domain: bool,
}

/// What the front-end server tells us about one request.
#[derive(Clone, Debug)]
pub struct SsoRequest {
	/// Address the request came from.
	pub remote_addr: IpAddr,
	/// Server variables, e.g. `REMOTE_USER`.
	pub vars: HashMap<String, String>,
}

impl SsoConfig {
	/// Extract a trustworthy login name from a request, if there is one.
	///
	/// Returns `None` when the client address is not permitted, the
	/// configured variable is absent, or its value is empty.
	#[must_use]
	pub fn detect(&self, request: &SsoRequest) -> Option<String> {
		if let Some(rules) = &self.rules {
			if !rules.permits(request.remote_addr) {
				debug!(addr = %request.remote_addr, "client address outside the SSO rules");
				return None;
			}
		}
		let raw = request.vars.get(&self.variable)?.trim();
		if raw.is_empty() {
			return None;
		}
		let name = if self.strip_domain { strip_domain(raw) } else { raw };
		if name.is_empty() {
			return None;
		}
		Some(name.to_owned())
	}
}

/// Remove `DOMAIN\` prefixes and `@domain` suffixes from a login name.
fn strip_domain(raw: &str) -> &str {
	if let Some((_, name)) = raw.rsplit_once('\\') {
		return name;
	}
	if let Some((name, _)) = raw.split_once('@') {
		return name;
	}
	raw
}

/// Default request variable.
fn default_variable() -> String {
	"REMOTE_USER".to_owned()
}
