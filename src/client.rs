//! Connection handling and raw operations against one directory host.
use std::{collections::HashSet, time::Duration};

use ldap3::{LdapConnAsync, LdapResult, Mod, Scope, SearchEntry, SearchResult};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
	config::{BindConfig, HostConfig},
	error::Error,
};

/// Result code for `invalidCredentials`.
const RC_INVALID_CREDENTIALS: u32 = 49;
/// Result code for `noSuchObject`.
const RC_NO_SUCH_OBJECT: u32 = 32;

/// An open connection to one configured host.
///
/// The connection task runs in the background; [`LdapClient::close`] unbinds
/// and joins it.
#[derive(Debug)]
pub struct LdapClient {
	/// Name of the host this connection belongs to.
	host: String,
	/// The protocol handle.
	pub(crate) ldap: ldap3::Ldap,
	/// Timeout applied to each operation.
	timeout: Duration,
	/// The spawned connection driver.
	driver: JoinHandle<()>,
}

impl LdapClient {
	/// Connect to a host based on the settings and url specified in its
	/// configuration. No bind is performed yet.
	pub async fn connect(config: &HostConfig) -> Result<Self, Error> {
		let settings = config.connection.to_settings().await?;
		let (conn, ldap) = LdapConnAsync::from_url_with_settings(settings, &config.url)
			.await
			.map_err(|source| Error::Connect { host: config.name.clone(), source })?;
		let driver = tokio::spawn(async move {
			if let Err(err) = conn.drive().await {
				warn!("LDAP connection error: {err}");
			}
		});
		debug!(host = %config.name, url = %config.url, "connected");
		Ok(LdapClient {
			host: config.name.clone(),
			ldap,
			timeout: config.connection.operation_timeout,
			driver,
		})
	}

	/// Name of the configured host this connection belongs to.
	#[must_use]
	pub fn host(&self) -> &str {
		&self.host
	}

	/// Bind with the service account, or anonymously where that is allowed.
	pub async fn proxy_bind(&mut self, bind: &BindConfig) -> Result<(), Error> {
		let (dn, password) = proxy_identity(&self.host, bind)?;
		self.ldap
			.with_timeout(self.timeout)
			.simple_bind(dn, password)
			.await
			.and_then(LdapResult::success)
			.map_err(|source| Error::ProxyBind { host: self.host.clone(), source })?;
		debug!(host = %self.host, dn, "proxy bind succeeded");
		Ok(())
	}

	/// Bind as the user to verify their password.
	///
	/// Empty passwords are rejected locally; the protocol would treat such a
	/// bind as unauthenticated and let it succeed.
	pub async fn user_bind(&mut self, dn: &str, password: &str) -> Result<(), Error> {
		if password.trim().is_empty() {
			return Err(Error::EmptyPassword);
		}
		match self
			.ldap
			.with_timeout(self.timeout)
			.simple_bind(dn, password)
			.await
			.and_then(LdapResult::success)
		{
			Ok(_) => Ok(()),
			Err(ldap3::LdapError::LdapResult { result })
				if result.rc == RC_INVALID_CREDENTIALS =>
			{
				debug!(dn, "bind rejected: invalid credentials");
				Err(Error::InvalidCredentials)
			}
			Err(source) => Err(source.into()),
		}
	}

	/// Run a subtree search and collect all matching entries.
	pub async fn search(
		&mut self,
		base: &str,
		filter: &str,
		attrs: Vec<String>,
	) -> Result<Vec<SearchEntry>, Error> {
		let (entries, _result) = self
			.ldap
			.with_timeout(self.timeout)
			.search(base, Scope::Subtree, filter, attrs)
			.await?
			.success()?;
		Ok(entries.into_iter().map(SearchEntry::construct).collect())
	}

	/// Run a subtree search expected to match one entry.
	///
	/// Extra matches are logged and dropped.
	pub async fn search_one(
		&mut self,
		base: &str,
		filter: &str,
		attrs: Vec<String>,
	) -> Result<Option<SearchEntry>, Error> {
		let entries = self.search(base, filter, attrs).await?;
		if entries.len() > 1 {
			warn!(
				host = %self.host,
				filter,
				"filter matched {} entries, using the first",
				entries.len()
			);
		}
		Ok(entries.into_iter().next())
	}

	/// Read a single entry by its distinguished name.
	///
	/// Returns `None` when the entry does not exist.
	pub async fn read(
		&mut self,
		dn: &str,
		attrs: Vec<String>,
	) -> Result<Option<SearchEntry>, Error> {
		match self
			.ldap
			.with_timeout(self.timeout)
			.search(dn, Scope::Base, "(objectClass=*)", attrs)
			.await
			.and_then(SearchResult::success)
		{
			Ok((entries, _result)) => Ok(entries.into_iter().next().map(SearchEntry::construct)),
			Err(ldap3::LdapError::LdapResult { result }) if result.rc == RC_NO_SUCH_OBJECT => {
				Ok(None)
			}
			Err(source) => Err(source.into()),
		}
	}

	/// Ask the server whether `dn` carries `value` in `attr`.
	///
	/// This is the compare operation: the server answers from its own
	/// matching rules, so it works for attributes the client may not read.
	pub async fn compare(&mut self, dn: &str, attr: &str, value: &str) -> Result<bool, Error> {
		Ok(self.ldap.with_timeout(self.timeout).compare(dn, attr, value).await?.equal()?)
	}

	/// Replace all values of one attribute on an entry.
	pub async fn modify_replace(
		&mut self,
		dn: &str,
		attr: &str,
		values: Vec<String>,
	) -> Result<(), Error> {
		let values: HashSet<String> = values.into_iter().collect();
		self.ldap
			.with_timeout(self.timeout)
			.modify(dn, vec![Mod::Replace(attr.to_owned(), values)])
			.await?
			.success()?;
		Ok(())
	}

	/// Unbind and wait for the connection task to finish.
	pub async fn close(self) -> Result<(), Error> {
		let LdapClient { mut ldap, driver, .. } = self;
		ldap.unbind().await?;
		if let Err(err) = driver.await {
			warn!("failed to join the connection task: {err}");
		}
		Ok(())
	}
}

/// Close a connection, demoting any error to a log line.
pub(crate) async fn close_quietly(client: LdapClient, host: &str) {
	if let Err(err) = client.close().await {
		debug!(host, "closing the connection failed: {err}");
	}
}

/// Pick the identity for the service bind.
fn proxy_identity<'a>(host: &str, bind: &'a BindConfig) -> Result<(&'a str, &'a str), Error> {
	match (&bind.proxy_dn, bind.allow_anonymous) {
		(Some(dn), _) => Ok((dn.as_str(), bind.proxy_password.as_deref().unwrap_or_default())),
		(None, true) => Ok(("", "")),
		(None, false) => Err(Error::Config(format!(
			"host {host:?} has no proxy credentials and anonymous binds are disabled"
		))),
	}
}
