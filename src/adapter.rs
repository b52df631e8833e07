//! Per-host view of directory users.
//!
//! A [`UserAdapter`] wraps an open [`LdapClient`] together with the host's
//! configuration and offers the operations the rest of the crate works in:
//! resolving a login name to a distinguished name, fetching a
//! [`UserRecord`], checking group membership and changing passwords.
use std::collections::HashMap;

use ldap3::SearchEntry;
use tracing::debug;

use crate::{
	client::LdapClient,
	config::{AttributeMap, HostConfig},
	entry::SearchEntryExt,
	error::Error,
	filter::{self, UserQuery, DN_TOKEN, USERNAME_TOKEN},
};

/// What the directory knows about one user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserRecord {
	/// The login name, read from the configured uid attribute.
	pub username: String,
	/// The entry's distinguished name.
	pub dn: String,
	/// Display name.
	pub name: Option<String>,
	/// Email address.
	pub email: Option<String>,
	/// Whether the account is enabled, where the directory tracks that.
	pub enabled: Option<bool>,
	/// Distinguished names of the groups the user belongs to.
	pub groups: Vec<String>,
	/// The configured additional attributes, verbatim.
	pub attributes: HashMap<String, Vec<String>>,
}

impl UserRecord {
	/// Converts a [`SearchEntry`] to a [`UserRecord`] using the attribute
	/// names in the given configuration.
	///
	/// Groups are taken from `membership_attribute`; a forward group search
	/// may add more afterwards.
	pub fn from_entry(
		entry: &SearchEntry,
		attributes: &AttributeMap,
		membership_attribute: &str,
	) -> Result<Self, Error> {
		let username = entry
			.attr_first(&attributes.uid)
			.ok_or_else(|| Error::Missing(attributes.uid.clone()))?
			.to_owned();
		let name = entry.attr_first(&attributes.name).map(String::from);
		let email = entry.attr_first(&attributes.email).map(String::from);
		let enabled = match &attributes.enabled {
			Some(attr) => entry.bool_first(attr).transpose()?,
			None => None,
		};
		let groups = entry.attr_all(membership_attribute).to_vec();
		let mut extra = HashMap::new();
		for attr in &attributes.additional {
			let values = entry.attr_all(attr);
			if !values.is_empty() {
				extra.insert(attr.clone(), values.to_vec());
			}
		}
		Ok(UserRecord {
			username,
			dn: entry.dn.clone(),
			name,
			email,
			enabled,
			groups,
			attributes: extra,
		})
	}
}

/// Directory operations for users of one host.
#[derive(Debug)]
pub struct UserAdapter<'a> {
	/// The open connection.
	client: &'a mut LdapClient,
	/// The host's configuration.
	config: &'a HostConfig,
}

impl<'a> UserAdapter<'a> {
	/// Wrap an open connection. The client is expected to already hold the
	/// proxy bind.
	#[must_use]
	pub fn new(client: &'a mut LdapClient, config: &'a HostConfig) -> Self {
		UserAdapter { client, config }
	}

	/// Resolve a login name to a distinguished name.
	///
	/// With a filter query this searches the directory; with a DN template
	/// it substitutes without a round trip, so the name is only known to
	/// exist once a later operation touches it.
	pub async fn find_dn(&mut self, username: &str) -> Result<String, Error> {
		match &self.config.search.user_query {
			UserQuery::Filter(template) => {
				let filter = user_filter(template, username);
				let entry = self
					.client
					.search_one(&self.config.search.base_dn, &filter, vec!["1.1".to_owned()])
					.await?
					.ok_or_else(|| Error::UserNotFound(username.to_owned()))?;
				Ok(entry.dn)
			}
			UserQuery::DnTemplate(template) => Ok(user_dn(template, username)),
		}
	}

	/// Fetch the full record for a login name.
	pub async fn fetch(&mut self, username: &str) -> Result<UserRecord, Error> {
		let attrs = self.fetch_attrs();
		let entry = match &self.config.search.user_query {
			UserQuery::Filter(template) => {
				let filter = user_filter(template, username);
				self.client.search_one(&self.config.search.base_dn, &filter, attrs).await?
			}
			UserQuery::DnTemplate(template) => {
				self.client.read(&user_dn(template, username), attrs).await?
			}
		}
		.ok_or_else(|| Error::UserNotFound(username.to_owned()))?;
		self.record_from(&entry).await
	}

	/// Build a record from an already-fetched entry, completing the group
	/// list with the forward search where one is configured.
	pub async fn record_from(&mut self, entry: &SearchEntry) -> Result<UserRecord, Error> {
		let mut record = UserRecord::from_entry(
			entry,
			&self.config.attributes,
			&self.config.groups.membership_attribute,
		)?;
		if let Some(group_search) = &self.config.groups.search {
			let filter = filter::substitute(
				&filter::substitute(
					&group_search.filter,
					DN_TOKEN,
					&filter::escape_value(&record.dn),
				),
				USERNAME_TOKEN,
				&filter::escape_value(&record.username),
			);
			let groups = self
				.client
				.search(&group_search.base_dn, &filter, vec!["1.1".to_owned()])
				.await?;
			debug!(
				username = %record.username,
				"forward group search found {} groups",
				groups.len()
			);
			for group in groups {
				if !record.groups.iter().any(|seen| seen.eq_ignore_ascii_case(&group.dn)) {
					record.groups.push(group.dn);
				}
			}
		}
		Ok(record)
	}

	/// The attribute list for user fetches.
	pub(crate) fn fetch_attrs(&self) -> Vec<String> {
		let mut attrs = self.config.attributes.as_list();
		let membership = &self.config.groups.membership_attribute;
		if self.config.attributes.filter_attributes
			&& !attrs.iter().any(|attr| attr.eq_ignore_ascii_case(membership))
		{
			attrs.push(membership.clone());
		}
		attrs
	}

	/// Verify a password by binding as the user, then restore the search
	/// identity.
	pub async fn verify_password(&mut self, dn: &str, password: &str) -> Result<(), Error> {
		self.client.user_bind(dn, password).await?;
		self.client.proxy_bind(&self.config.bind).await?;
		Ok(())
	}

	/// Ask the server whether the user is a member of a group, using the
	/// compare operation on the group entry.
	pub async fn is_member_of(&mut self, user_dn: &str, group_dn: &str) -> Result<bool, Error> {
		self.client.compare(group_dn, &self.config.groups.member_attribute, user_dn).await
	}

	/// Replace the user's password attribute.
	pub async fn change_password(&mut self, dn: &str, new_password: &str) -> Result<(), Error> {
		self.client
			.modify_replace(dn, &self.config.attributes.password, vec![new_password.to_owned()])
			.await
	}
}

/// Build the search filter for a login name.
fn user_filter(template: &str, username: &str) -> String {
	filter::substitute(template, USERNAME_TOKEN, &filter::escape_value(username))
}

/// Build the distinguished name for a login name.
fn user_dn(template: &str, username: &str) -> String {
	filter::substitute(template, USERNAME_TOKEN, &filter::escape_dn_value(username))
}
