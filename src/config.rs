//! Configuration for directory hosts, SSO detection, sync and the store.
use std::{
	collections::HashSet,
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};

use ldap3::LdapConnSettings;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
	error::Error,
	filter::UserQuery,
	groups::{MappingRule, MatchMode},
	sso::SsoConfig,
};

/// Root configuration.
///
/// `hosts` is ordered. Authentication walks it front to back and stops at
/// the first host that gives an answer, so later hosts only see a login
/// when every host before them failed with an infrastructure error. A sync
/// runs one pass per host instead.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
	/// The directory hosts to try, in fallback order.
	pub hosts: Vec<HostConfig>,
	/// Single-sign-on detection rules, if enabled.
	#[serde(default)]
	pub sso: Option<SsoConfig>,
	/// Batch synchronization behavior.
	#[serde(default)]
	pub sync: SyncConfig,
	/// Local store location.
	#[serde(default)]
	pub store: StoreConfig,
}

impl Config {
	/// Load and validate a YAML configuration file.
	pub async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
		let raw = tokio::fs::read_to_string(path.as_ref()).await?;
		let config: Config = serde_yaml::from_str(&raw)?;
		config.validate()?;
		Ok(config)
	}

	/// Check cross-field invariants that serde cannot express.
	pub fn validate(&self) -> Result<(), Error> {
		if self.hosts.is_empty() {
			return Err(Error::Config("no directory hosts configured".to_owned()));
		}
		let mut names = HashSet::new();
		for host in &self.hosts {
			if host.name.trim().is_empty() {
				return Err(Error::Config("host with empty name".to_owned()));
			}
			if !names.insert(host.name.as_str()) {
				return Err(Error::Config(format!("duplicate host name {:?}", host.name)));
			}
			host.validate()?;
		}
		Ok(())
	}

	/// Look up a host by its configured name.
	#[must_use]
	pub fn host(&self, name: &str) -> Option<&HostConfig> {
		self.hosts.iter().find(|host| host.name == name)
	}
}

/// One directory host.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostConfig {
	/// Unique name of this host, also recorded in adapter links.
	pub name: String,
	/// The URL to connect to the server with. Supports ldap, ldaps, and
	/// ldapi schemes.
	pub url: Url,
	/// Connection settings.
	#[serde(default)]
	pub connection: ConnectionConfig,
	/// Bind credentials for searches.
	#[serde(default)]
	pub bind: BindConfig,
	/// Bases, filters and templates for lookups.
	pub search: SearchConfig,
	/// Names of attributes to read and map.
	pub attributes: AttributeMap,
	/// Group collection and role mapping.
	#[serde(default)]
	pub groups: GroupConfig,
}

impl HostConfig {
	/// Check invariants of a single host block.
	fn validate(&self) -> Result<(), Error> {
		if self.search.base_dn.trim().is_empty() {
			return Err(Error::Config(format!("host {:?} has an empty base DN", self.name)));
		}
		if let Some(page_size) = self.search.page_size {
			if page_size <= 0 {
				return Err(Error::Config(format!(
					"host {:?} has a non-positive page size",
					self.name
				)));
			}
		}
		Ok(())
	}
}

/// Configuration for how to connect to the LDAP server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionConfig {
	/// Timeout to establish a connection, in seconds.
	#[serde(default = "default_timeout")]
	pub timeout: u64,

	/// LDAP operation timeout, applied per request.
	#[serde(default = "default_operation_timeout")]
	pub operation_timeout: Duration,

	/// TLS config.
	#[serde(default)]
	pub tls: TlsConfig,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		ConnectionConfig {
			timeout: default_timeout(),
			operation_timeout: default_operation_timeout(),
			tls: TlsConfig::default(),
		}
	}
}

/// TLS Configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TlsConfig {
	/// Use the StartTLS extended operation for establishing a secure
	/// connection, rather than TLS on a dedicated port.
	#[serde(default)]
	pub starttls: bool,

	/// Disable verification of TLS certificates.
	#[serde(default)]
	pub no_tls_verify: bool,

	/// TLS root certificates path.
	#[serde(default)]
	pub root_certificates_path: Option<PathBuf>,

	/// Path of the TLS client key to use for the connection.
	#[serde(default)]
	pub client_key_path: Option<PathBuf>,

	/// Path of the TLS client certificate to use for the connection.
	#[serde(default)]
	pub client_certificate_path: Option<PathBuf>,
}

impl ConnectionConfig {
	/// Create [`LdapConnSettings`] based on this [`ConnectionConfig`].
	pub(crate) async fn to_settings(&self) -> Result<LdapConnSettings, Error> {
		let mut settings = LdapConnSettings::new();

		settings = settings.set_conn_timeout(Duration::from_secs(self.timeout));
		settings = settings.set_starttls(self.tls.starttls);
		settings = settings.set_no_tls_verify(self.tls.no_tls_verify);

		if let Some(path) = &self.tls.root_certificates_path {
			let mut roots = rustls::RootCertStore::empty();
			let pem = tokio::fs::read(path).await?;
			let mut reader = pem.as_slice();
			let certs = rustls_pemfile::certs(&mut reader)?;
			let (added, _ignored) = roots.add_parsable_certificates(&certs);
			if added == 0 {
				return Err(Error::Tls(format!(
					"no usable root certificate in {}",
					path.display()
				)));
			}

			let builder =
				rustls::ClientConfig::builder().with_safe_defaults().with_root_certificates(roots);

			let tls_config = match (&self.tls.client_certificate_path, &self.tls.client_key_path) {
				(Some(cert_path), Some(key_path)) => {
					let cert_pem = tokio::fs::read(cert_path).await?;
					let mut cert_reader = cert_pem.as_slice();
					let chain = rustls_pemfile::certs(&mut cert_reader)?
						.into_iter()
						.map(rustls::Certificate)
						.collect::<Vec<_>>();
					let key_pem = tokio::fs::read(key_path).await?;
					let mut key_reader = key_pem.as_slice();
					let key = rustls_pemfile::pkcs8_private_keys(&mut key_reader)?
						.into_iter()
						.next()
						.ok_or_else(|| {
							Error::Tls(format!("no PKCS#8 key in {}", key_path.display()))
						})?;
					builder
						.with_client_auth_cert(chain, rustls::PrivateKey(key))
						.map_err(|err| Error::Tls(format!("client identity rejected: {err}")))?
				}
				(None, None) => builder.with_no_client_auth(),
				_ => {
					return Err(Error::Tls(
						"client certificate and key must be configured together".to_owned(),
					))
				}
			};
			settings = settings.set_config(Arc::new(tls_config));
		}
		Ok(settings)
	}
}

/// Credentials for the proxy (service account) bind used for searches.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BindConfig {
	/// DN of the service account.
	#[serde(default)]
	pub proxy_dn: Option<String>,
	/// Password of the service account.
	#[serde(default)]
	pub proxy_password: Option<String>,
	/// Permit an anonymous bind when no service account is configured.
	#[serde(default)]
	pub allow_anonymous: bool,
}

/// Configurable bases and templates to use for lookups.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
	/// The search base for user lookups and sync enumeration.
	pub base_dn: String,
	/// How a login name maps to a directory entry; see [`UserQuery`].
	pub user_query: UserQuery,
	/// If set, enables the [simple paged search control] and sets the page
	/// size to the given value.
	///
	/// [simple paged search control]: https://www.rfc-editor.org/rfc/rfc2696.html
	#[serde(default)]
	pub page_size: Option<i32>,
}

/// Names of attributes to use for extracting relevant data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttributeMap {
	/// The attribute holding the login name (also the sync key).
	#[serde(default = "default_uid_attribute")]
	pub uid: String,
	/// The attribute holding the display name.
	#[serde(default = "default_name_attribute")]
	pub name: String,
	/// The attribute holding the email address.
	#[serde(default = "default_email_attribute")]
	pub email: String,
	/// Optional attribute holding a `TRUE`/`FALSE` enabled flag.
	#[serde(default)]
	pub enabled: Option<String>,
	/// The attribute a password change writes to.
	#[serde(default = "default_password_attribute")]
	pub password: String,
	/// Additional attributes to fetch into the record verbatim.
	#[serde(default)]
	pub additional: Vec<String>,
	/// Whether to explicitly filter for attributes in the search request.
	/// When false, `*` is requested instead.
	#[serde(default = "default_true")]
	pub filter_attributes: bool,
}

impl AttributeMap {
	/// Returns the list of LDAP object attributes the server should return.
	#[must_use]
	pub fn as_list(&self) -> Vec<String> {
		if !self.filter_attributes {
			return vec!["*".to_owned()];
		}
		let mut list = vec![self.uid.clone(), self.name.clone(), self.email.clone()];
		if let Some(enabled) = &self.enabled {
			list.push(enabled.clone());
		}
		for attr in &self.additional {
			if !list.iter().any(|seen| seen.eq_ignore_ascii_case(attr)) {
				list.push(attr.clone());
			}
		}
		list
	}

	/// Returns an example map for tests.
	#[allow(dead_code)]
	pub(crate) fn example() -> Self {
		AttributeMap {
			uid: "uid".to_owned(),
			name: "cn".to_owned(),
			email: "mail".to_owned(),
			enabled: Some("employeeType".to_owned()),
			password: default_password_attribute(),
			additional: vec!["telephoneNumber".to_owned()],
			filter_attributes: true,
		}
	}
}

/// Group collection and role mapping for one host.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupConfig {
	/// The user attribute listing group memberships.
	#[serde(default = "default_membership_attribute")]
	pub membership_attribute: String,
	/// The group attribute naming members, used by the compare operation.
	#[serde(default = "default_member_attribute")]
	pub member_attribute: String,
	/// Optional forward search for groups, for directories without a
	/// membership attribute on user entries.
	#[serde(default)]
	pub search: Option<GroupSearch>,
	/// How mapping rules compare against group names.
	#[serde(default)]
	pub match_mode: MatchMode,
	/// Group-to-role mapping rules.
	#[serde(default)]
	pub rules: Vec<MappingRule>,
}

impl Default for GroupConfig {
	fn default() -> Self {
		GroupConfig {
			membership_attribute: default_membership_attribute(),
			member_attribute: default_member_attribute(),
			search: None,
			match_mode: MatchMode::default(),
			rules: Vec::new(),
		}
	}
}

/// A forward group search: find groups that reference the user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupSearch {
	/// The search base for group entries.
	pub base_dn: String,
	/// Filter template; `[dn]` and `[username]` are substituted.
	pub filter: String,
}

/// Batch synchronization behavior.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncConfig {
	/// What to do with linked users the full pass did not see.
	#[serde(default)]
	pub on_missing: OnMissing,
}

/// Handling of linked local users that are no longer in the directory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMissing {
	/// Leave the local row untouched.
	#[default]
	Ignore,
	/// Disable the local row.
	Disable,
	/// Delete the local row and its link.
	Delete,
}

/// Local store location.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
	/// Path of the SQLite database file.
	#[serde(default = "default_store_path")]
	pub path: PathBuf,
}

impl Default for StoreConfig {
	fn default() -> Self {
		StoreConfig { path: default_store_path() }
	}
}

/// Default connect timeout in seconds.
fn default_timeout() -> u64 {
	15
}

/// Default per-operation timeout.
fn default_operation_timeout() -> Duration {
	Duration::from_secs(30)
}

/// Default login name attribute.
fn default_uid_attribute() -> String {
	"uid".to_owned()
}

/// Default display name attribute.
fn default_name_attribute() -> String {
	"cn".to_owned()
}

/// Default email attribute.
fn default_email_attribute() -> String {
	"mail".to_owned()
}

/// Default password attribute.
fn default_password_attribute() -> String {
	"userPassword".to_owned()
}

/// Default membership attribute.
fn default_membership_attribute() -> String {
	"memberOf".to_owned()
}

/// Default group member attribute.
fn default_member_attribute() -> String {
	"member".to_owned()
}

/// Default store path.
fn default_store_path() -> PathBuf {
	PathBuf::from("ldap-bridge.db")
}

/// Serde default helper.
fn default_true() -> bool {
	true
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used, clippy::expect_used)]

	use std::{io::ErrorKind, path::PathBuf};

	use super::{AttributeMap, Config, ConnectionConfig, OnMissing, TlsConfig};
	use crate::{error::Error, filter::UserQuery};

	/// A full configuration document exercising every section.
	const FULL: &str = r#"
hosts:
  - name: primary
    url: ldap://ldap1.example.org:389
    connection:
      timeout: 5
      tls:
        starttls: true
    bind:
      proxy_dn: cn=search,dc=example,dc=org
      proxy_password: secret
    search:
      base_dn: ou=People,dc=example,dc=org
      user_query: "(uid=[username])"
      page_size: 500
    attributes:
      uid: uid
      name: cn
      email: mail
      additional: [telephoneNumber]
    groups:
      membership_attribute: memberOf
      match_mode: components
      rules:
        - group: cn=admins,ou=groups,dc=example,dc=org
          roles: [admin]
  - name: fallback
    url: ldaps://ldap2.example.org
    search:
      base_dn: ou=People,dc=example,dc=org
      user_query: uid=[username],ou=People,dc=example,dc=org
    attributes: {}
sso:
  rules:
    mode: allow_listed
    addresses: ["10.0.0.0/8", "192.168.1.*"]
  variable: REMOTE_USER
  strip_domain: true
sync:
  on_missing: disable
store:
  path: /var/lib/bridge/users.db
"#;

	#[test]
	fn full_document_parses() {
		let config: Config = serde_yaml::from_str(FULL).unwrap();
		config.validate().unwrap();

		assert_eq!(config.hosts.len(), 2);
		let primary = config.host("primary").unwrap();
		assert_eq!(primary.connection.timeout, 5);
		assert!(primary.connection.tls.starttls);
		assert_eq!(primary.bind.proxy_dn.as_deref(), Some("cn=search,dc=example,dc=org"));
		assert!(matches!(primary.search.user_query, UserQuery::Filter(_)));
		assert_eq!(primary.search.page_size, Some(500));
		assert_eq!(primary.groups.rules.len(), 1);

		let fallback = config.host("fallback").unwrap();
		assert!(matches!(fallback.search.user_query, UserQuery::DnTemplate(_)));
		assert_eq!(fallback.attributes.uid, "uid");

		assert!(config.sso.is_some());
		assert_eq!(config.sync.on_missing, OnMissing::Disable);
		assert_eq!(config.store.path, PathBuf::from("/var/lib/bridge/users.db"));
	}

	#[test]
	fn duplicate_host_names_are_rejected() {
		let mut config: Config = serde_yaml::from_str(FULL).unwrap();
		config.hosts[1].name = "primary".to_owned();
		assert!(matches!(config.validate(), Err(Error::Config(_))));
	}

	#[test]
	fn attribute_list_is_deduplicated() {
		let map = AttributeMap::example();
		assert_eq!(map.as_list(), ["uid", "cn", "mail", "employeeType", "telephoneNumber"]);

		let mut map = AttributeMap::example();
		map.additional.push("MAIL".to_owned());
		assert_eq!(map.as_list(), ["uid", "cn", "mail", "employeeType", "telephoneNumber"]);

		let mut map = AttributeMap::example();
		map.filter_attributes = false;
		assert_eq!(map.as_list(), ["*"]);
	}

	#[tokio::test]
	async fn missing_tls_files_surface_io_errors() {
		let connection = ConnectionConfig {
			tls: TlsConfig {
				root_certificates_path: Some(PathBuf::from("does/not/exist.pem")),
				..TlsConfig::default()
			},
			..ConnectionConfig::default()
		};
		let err = connection.to_settings().await.err().unwrap();
		assert!(matches!(err, Error::Io(io_err) if io_err.kind() == ErrorKind::NotFound));
	}
}
