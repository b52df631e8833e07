//! Error types and the internal error code table.
//!
//! Every failure carries a stable internal code (see [`Error::code`]) next to
//! whatever the directory server reported. Authentication flows never hand the
//! detailed error to end users; they collapse it into [`AuthError`], whose
//! `Display` is a fixed generic message.

/// Errors that can occur when using this library.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// The configuration is unusable (no hosts, duplicate names, bad
	/// templates).
	#[error("invalid configuration: {0}")]
	Config(String),
	/// TLS material could not be loaded or assembled.
	#[error("TLS setup failed: {0}")]
	Tls(String),
	/// Establishing the connection to a directory host failed.
	#[error("connection to {host} failed")]
	Connect {
		/// Name of the configured host.
		host: String,
		/// The underlying protocol error.
		#[source]
		source: ldap3::LdapError,
	},
	/// The proxy (service account) bind was rejected.
	#[error("proxy bind on {host} rejected")]
	ProxyBind {
		/// Name of the configured host.
		host: String,
		/// The underlying protocol error.
		#[source]
		source: ldap3::LdapError,
	},
	/// A user bind was rejected by the directory (wrong password, or an
	/// account the server refuses to bind).
	#[error("invalid credentials")]
	InvalidCredentials,
	/// A user bind was attempted with an empty password. Rejected locally:
	/// the protocol would treat it as an unauthenticated bind and succeed.
	#[error("empty password rejected")]
	EmptyPassword,
	/// No directory entry matched the username.
	#[error("no distinguished name found for {0:?}")]
	UserNotFound(String),
	/// A required attribute in a search result was missing.
	#[error("missing attribute {0:?}")]
	Missing(String),
	/// The contents of an attribute or value did not conform to the expected
	/// syntax.
	#[error("malformed data: {0}")]
	Invalid(String),
	/// A distinguished name failed to parse.
	#[error("malformed distinguished name: {0}")]
	Dn(String),
	/// An address rule failed to parse.
	#[error("malformed address rule: {0}")]
	Rule(String),
	/// An underlying protocol error or similar occurred, or the LDAP library
	/// was used incorrectly.
	#[error(transparent)]
	Ldap(#[from] ldap3::LdapError),
	/// Reading configuration or certificate files failed.
	#[error(transparent)]
	Io(#[from] std::io::Error),
	/// The configuration file failed to parse.
	#[error("configuration parse error: {0}")]
	Yaml(#[from] serde_yaml::Error),
	/// Stored JSON (host profiles, user attributes) failed to encode or
	/// decode.
	#[error("stored data encoding error: {0}")]
	Json(#[from] serde_json::Error),
	/// The local store reported an error.
	#[error(transparent)]
	Store(#[from] sqlx::Error),
	/// A row insert would violate a uniqueness constraint that is checked
	/// up front.
	#[error("{0} already exists")]
	AlreadyExists(String),
}

impl Error {
	/// The stable internal code for this error.
	///
	/// Codes group by area: 1xx configuration, 2xx connection and binds,
	/// 3xx lookups and data, 4xx local store.
	#[must_use]
	pub fn code(&self) -> u16 {
		match self {
			Error::Config(_) => 101,
			Error::Yaml(_) => 102,
			Error::Io(_) => 103,
			Error::Tls(_) => 110,
			Error::Connect { .. } => 201,
			Error::ProxyBind { .. } => 202,
			Error::InvalidCredentials => 203,
			Error::EmptyPassword => 204,
			Error::Ldap(_) => 210,
			Error::UserNotFound(_) => 301,
			Error::Missing(_) => 302,
			Error::Invalid(_) => 303,
			Error::Dn(_) => 304,
			Error::Rule(_) => 305,
			Error::Store(_) => 401,
			Error::AlreadyExists(_) => 402,
			Error::Json(_) => 403,
		}
	}

	/// The result code the directory reported, if this error wraps one.
	#[must_use]
	pub fn ldap_rc(&self) -> Option<u32> {
		match self {
			Error::Ldap(ldap3::LdapError::LdapResult { result }) => Some(result.rc),
			Error::Connect { source: ldap3::LdapError::LdapResult { result }, .. }
			| Error::ProxyBind { source: ldap3::LdapError::LdapResult { result }, .. } => {
				Some(result.rc)
			}
			_ => None,
		}
	}
}

/// The collapsed failure returned by the authentication flow.
///
/// `Display` is always the same generic message so that directory internals
/// never leak to end users; the precise cause stays available through
/// [`AuthError::reason`] for logging.
#[derive(thiserror::Error, Debug)]
#[error("authentication failed")]
pub struct AuthError {
	/// The underlying failure. Logged, never displayed.
	reason: Error,
}

impl AuthError {
	/// Wrap a detailed error into the generic failure.
	pub(crate) fn new(reason: Error) -> Self {
		Self { reason }
	}

	/// The detailed cause, for logging and tests.
	#[must_use]
	pub fn reason(&self) -> &Error {
		&self.reason
	}
}

impl From<Error> for AuthError {
	fn from(reason: Error) -> Self {
		Self::new(reason)
	}
}
