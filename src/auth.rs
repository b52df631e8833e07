//! Authentication against the configured hosts.
//!
//! Hosts are tried in configuration order. Infrastructure failures
//! (unreachable server, rejected proxy bind, protocol errors) move on to
//! the next host; a rejected password or an unknown user is final, so a
//! typo never walks the whole host list and trips lockout counters on
//! every replica. Callers only ever see [`AuthError`], whose message is
//! deliberately generic; the detailed reason goes to the log.
use tracing::{info, warn};

use crate::{
	adapter::{UserAdapter, UserRecord},
	client::{close_quietly, LdapClient},
	config::{Config, HostConfig},
	error::{AuthError, Error},
	groups::GroupMapper,
	sso::SsoRequest,
};

/// A successfully authenticated user.
#[derive(Clone, Debug)]
pub struct AuthUser {
	/// Name of the host that answered.
	pub host: String,
	/// The directory record.
	pub record: UserRecord,
	/// Roles granted by the host's mapping rules.
	pub roles: Vec<String>,
}

/// Authenticates users against the configured hosts, in order.
#[derive(Clone, Debug)]
pub struct Authenticator {
	/// The validated configuration.
	config: Config,
}

impl Authenticator {
	/// Create an authenticator over a validated configuration.
	#[must_use]
	pub fn new(config: Config) -> Self {
		Authenticator { config }
	}

	/// Verify a username and password.
	///
	/// On failure the detailed reason is logged together with its internal
	/// code and any directory result code, and the caller gets the generic
	/// [`AuthError`].
	pub async fn authenticate(
		&self,
		username: &str,
		password: &str,
	) -> Result<AuthUser, AuthError> {
		match self.password_walk(username, password).await {
			Ok(user) => Ok(user),
			Err(err) => {
				warn!(
					username,
					code = err.code(),
					rc = err.ldap_rc(),
					"authentication failed: {err}"
				);
				Err(AuthError::new(err))
			}
		}
	}

	/// Complete the single sign-on flow for a request.
	///
	/// Returns `Ok(None)` when SSO is not configured or does not apply to
	/// this request, so the caller can fall back to interactive login.
	pub async fn authenticate_sso(
		&self,
		request: &SsoRequest,
	) -> Result<Option<AuthUser>, AuthError> {
		let Some(sso) = &self.config.sso else {
			return Ok(None);
		};
		let Some(username) = sso.detect(request) else {
			return Ok(None);
		};
		self.lookup(&username).await.map(Some)
	}

	/// Look a user up without verifying a password.
	///
	/// This is the lookup the SSO flow performs once a name is trusted; it
	/// also serves smoke tests and tooling that only need the record.
	pub async fn lookup(&self, username: &str) -> Result<AuthUser, AuthError> {
		match self.lookup_walk(username).await {
			Ok(user) => Ok(user),
			Err(err) => {
				warn!(username, code = err.code(), rc = err.ldap_rc(), "lookup failed: {err}");
				Err(AuthError::new(err))
			}
		}
	}

	/// Try each host with the password until one answers.
	async fn password_walk(&self, username: &str, password: &str) -> Result<AuthUser, Error> {
		if password.trim().is_empty() {
			return Err(Error::EmptyPassword);
		}
		let mut last = None;
		for host in &self.config.hosts {
			match self.password_on(host, username, password).await {
				Ok(user) => return Ok(user),
				// A rejected password or an unknown user is an answer, not
				// an outage.
				Err(
					err @ (Error::InvalidCredentials
					| Error::EmptyPassword
					| Error::UserNotFound(_)),
				) => return Err(err),
				Err(err) => {
					warn!(host = %host.name, code = err.code(), "host failed: {err}");
					last = Some(err);
				}
			}
		}
		last.map_or_else(
			|| Err(Error::Config("no directory hosts configured".to_owned())),
			Err,
		)
	}

	/// Try each host with a bare lookup until one answers.
	async fn lookup_walk(&self, username: &str) -> Result<AuthUser, Error> {
		let mut last = None;
		for host in &self.config.hosts {
			match self.lookup_on(host, username).await {
				Ok(user) => return Ok(user),
				Err(err @ Error::UserNotFound(_)) => return Err(err),
				Err(err) => {
					warn!(host = %host.name, code = err.code(), "host failed: {err}");
					last = Some(err);
				}
			}
		}
		last.map_or_else(
			|| Err(Error::Config("no directory hosts configured".to_owned())),
			Err,
		)
	}

	/// Authenticate on one host: proxy bind, fetch, user bind.
	async fn password_on(
		&self,
		host: &HostConfig,
		username: &str,
		password: &str,
	) -> Result<AuthUser, Error> {
		let mut client = LdapClient::connect(host).await?;
		let outcome: Result<AuthUser, Error> = async {
			client.proxy_bind(&host.bind).await?;
			let mut adapter = UserAdapter::new(&mut client, host);
			let record = adapter.fetch(username).await?;
			adapter.verify_password(&record.dn, password).await?;
			Ok(finish(host, record))
		}
		.await;
		close_quietly(client, &host.name).await;
		if outcome.is_ok() {
			info!(host = %host.name, username, "authenticated");
		}
		outcome
	}

	/// Look a user up on one host without verifying a password.
	async fn lookup_on(&self, host: &HostConfig, username: &str) -> Result<AuthUser, Error> {
		let mut client = LdapClient::connect(host).await?;
		let outcome: Result<AuthUser, Error> = async {
			client.proxy_bind(&host.bind).await?;
			let mut adapter = UserAdapter::new(&mut client, host);
			let record = adapter.fetch(username).await?;
			Ok(finish(host, record))
		}
		.await;
		close_quietly(client, &host.name).await;
		if outcome.is_ok() {
			info!(host = %host.name, username, "resolved");
		}
		outcome
	}
}

/// Map the record's groups onto roles and assemble the result.
fn finish(host: &HostConfig, record: UserRecord) -> AuthUser {
	let mapper = GroupMapper::new(host.groups.match_mode, host.groups.rules.clone());
	let roles = mapper.roles_for(&record.groups);
	AuthUser { host: host.name.clone(), record, roles }
}
