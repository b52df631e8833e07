//! Local SQLite store: synced users, adapter links, settings and host
//! profiles.
use std::{collections::HashMap, path::Path, str::FromStr};

use sqlx::{
	sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
	Pool, Row, Sqlite,
};
use time::OffsetDateTime;

use crate::{adapter::UserRecord, config::HostConfig, error::Error};

/// The pool type used throughout the store.
pub type SqlitePool = Pool<Sqlite>;

/// Schema, applied on open. Statements are separated by `;` and must not
/// contain one elsewhere.
const SQLITE_INIT: &str = r"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    name TEXT NULL,
    email TEXT NULL,
    password TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 1,
    attributes TEXT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS adapter_links (
    user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
    host TEXT NOT NULL,
    dn TEXT NOT NULL,
    last_seen INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_adapter_links_host ON adapter_links(host);
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS host_profiles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    enabled INTEGER NOT NULL DEFAULT 1,
    profile TEXT NOT NULL
)";

/// A local user row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredUser {
	/// Row id.
	pub id: i64,
	/// Unique login name, the sync key.
	pub username: String,
	/// Display name.
	pub name: Option<String>,
	/// Email address.
	pub email: Option<String>,
	/// Local password hash. Empty for directory-backed accounts.
	pub password: String,
	/// Whether the account may log in.
	pub enabled: bool,
	/// Additional synced attributes.
	pub attributes: HashMap<String, Vec<String>>,
	/// When the row was created.
	pub created_at: OffsetDateTime,
	/// When the row last changed.
	pub updated_at: OffsetDateTime,
}

/// The directory-sourced fields of a user row, as sync writes them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserFields {
	/// Unique login name.
	pub username: String,
	/// Display name.
	pub name: Option<String>,
	/// Email address.
	pub email: Option<String>,
	/// Whether the account may log in.
	pub enabled: bool,
	/// Additional synced attributes.
	pub attributes: HashMap<String, Vec<String>>,
}

impl StoredUser {
	/// Whether the row already carries exactly these fields, in which case
	/// sync counts the user as unchanged.
	#[must_use]
	pub fn matches(&self, fields: &UserFields) -> bool {
		self.username == fields.username
			&& self.name == fields.name
			&& self.email == fields.email
			&& self.enabled == fields.enabled
			&& self.attributes == fields.attributes
	}
}

/// The link between a local user row and the directory entry it mirrors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterLink {
	/// The linked user row.
	pub user_id: i64,
	/// Name of the host the entry lives on.
	pub host: String,
	/// Distinguished name of the entry.
	pub dn: String,
	/// When sync last saw the entry.
	pub last_seen: OffsetDateTime,
}

/// A host configuration kept in the store rather than the config file.
#[derive(Clone, Debug)]
pub struct HostProfile {
	/// Row id.
	pub id: i64,
	/// Unique profile name.
	pub name: String,
	/// Whether the profile should be used.
	pub enabled: bool,
	/// The host configuration itself.
	pub profile: HostConfig,
}

/// Handle to the SQLite database.
#[derive(Clone, Debug)]
pub struct SqliteStore {
	/// The connection pool.
	pool: SqlitePool,
}

impl SqliteStore {
	/// Open (and create if missing) the database at `path`.
	pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
		let options = SqliteConnectOptions::new()
			.filename(path.as_ref())
			.create_if_missing(true)
			.foreign_keys(true);
		let pool = SqlitePoolOptions::new().connect_with(options).await?;
		let store = SqliteStore { pool };
		store.init_schema().await?;
		Ok(store)
	}

	/// Open an in-memory database.
	///
	/// The pool is capped at one connection: every SQLite `:memory:`
	/// connection is its own database.
	pub async fn in_memory() -> Result<Self, Error> {
		let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
		let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
		let store = SqliteStore { pool };
		store.init_schema().await?;
		Ok(store)
	}

	/// The underlying pool.
	#[must_use]
	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	/// Initialize the schema by executing the bundled DDL statement by
	/// statement, since a single query must not contain several.
	async fn init_schema(&self) -> Result<(), Error> {
		for stmt in SQLITE_INIT.split(';') {
			let stmt = stmt.trim();
			if stmt.is_empty() {
				continue;
			}
			sqlx::query(stmt).execute(&self.pool).await?;
		}
		Ok(())
	}

	/// Look a user up by login name.
	pub async fn user_by_username(&self, username: &str) -> Result<Option<StoredUser>, Error> {
		let row = sqlx::query(
			"SELECT id, username, name, email, password, enabled, attributes,
			        created_at, updated_at
			 FROM users WHERE username = ?",
		)
		.bind(username)
		.fetch_optional(&self.pool)
		.await?;
		row.map(user_from_row).transpose()
	}

	/// Insert a new user row. Returns its id.
	pub async fn insert_user(&self, fields: &UserFields) -> Result<i64, Error> {
		let now = OffsetDateTime::now_utc().unix_timestamp();
		let result = sqlx::query(
			"INSERT INTO users (username, name, email, password, enabled, attributes,
			                    created_at, updated_at)
			 VALUES (?, ?, ?, '', ?, ?, ?, ?)",
		)
		.bind(&fields.username)
		.bind(&fields.name)
		.bind(&fields.email)
		.bind(fields.enabled)
		.bind(encode_attributes(&fields.attributes)?)
		.bind(now)
		.bind(now)
		.execute(&self.pool)
		.await?;
		Ok(result.last_insert_rowid())
	}

	/// Overwrite the directory-sourced fields of an existing row.
	pub async fn update_user(&self, id: i64, fields: &UserFields) -> Result<(), Error> {
		let now = OffsetDateTime::now_utc().unix_timestamp();
		sqlx::query(
			"UPDATE users SET username = ?, name = ?, email = ?, enabled = ?,
			        attributes = ?, updated_at = ?
			 WHERE id = ?",
		)
		.bind(&fields.username)
		.bind(&fields.name)
		.bind(&fields.email)
		.bind(fields.enabled)
		.bind(encode_attributes(&fields.attributes)?)
		.bind(now)
		.bind(id)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	/// Enable or disable a user row.
	pub async fn set_user_enabled(&self, id: i64, enabled: bool) -> Result<(), Error> {
		let now = OffsetDateTime::now_utc().unix_timestamp();
		sqlx::query("UPDATE users SET enabled = ?, updated_at = ? WHERE id = ?")
			.bind(enabled)
			.bind(now)
			.bind(id)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	/// Set a user's local password hash.
	pub async fn set_password(&self, id: i64, password: &str) -> Result<(), Error> {
		let now = OffsetDateTime::now_utc().unix_timestamp();
		sqlx::query("UPDATE users SET password = ?, updated_at = ? WHERE id = ?")
			.bind(password)
			.bind(now)
			.bind(id)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	/// Delete a user row. The adapter link goes with it.
	pub async fn delete_user(&self, id: i64) -> Result<(), Error> {
		sqlx::query("DELETE FROM users WHERE id = ?").bind(id).execute(&self.pool).await?;
		Ok(())
	}

	/// All user rows, ordered by login name.
	pub async fn list_users(&self) -> Result<Vec<StoredUser>, Error> {
		let rows = sqlx::query(
			"SELECT id, username, name, email, password, enabled, attributes,
			        created_at, updated_at
			 FROM users ORDER BY username",
		)
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(user_from_row).collect()
	}

	/// Number of user rows.
	pub async fn count_users(&self) -> Result<i64, Error> {
		let (count,): (i64,) =
			sqlx::query_as("SELECT COUNT(*) FROM users").fetch_one(&self.pool).await?;
		Ok(count)
	}

	/// Create or refresh the link between a user row and a directory entry.
	pub async fn link(
		&self,
		user_id: i64,
		host: &str,
		dn: &str,
		seen: OffsetDateTime,
	) -> Result<(), Error> {
		sqlx::query(
			"INSERT INTO adapter_links (user_id, host, dn, last_seen)
			 VALUES (?, ?, ?, ?)
			 ON CONFLICT(user_id) DO UPDATE SET
			     host = excluded.host,
			     dn = excluded.dn,
			     last_seen = excluded.last_seen",
		)
		.bind(user_id)
		.bind(host)
		.bind(dn)
		.bind(seen.unix_timestamp())
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	/// The link for one user row, if any.
	pub async fn link_for(&self, user_id: i64) -> Result<Option<AdapterLink>, Error> {
		let row = sqlx::query(
			"SELECT user_id, host, dn, last_seen FROM adapter_links WHERE user_id = ?",
		)
		.bind(user_id)
		.fetch_optional(&self.pool)
		.await?;
		row.map(link_from_row).transpose()
	}

	/// All links pointing at one host.
	pub async fn links_on(&self, host: &str) -> Result<Vec<AdapterLink>, Error> {
		let rows = sqlx::query(
			"SELECT user_id, host, dn, last_seen FROM adapter_links WHERE host = ?
			 ORDER BY user_id",
		)
		.bind(host)
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(link_from_row).collect()
	}

	/// Remove the link for one user row, keeping the row itself.
	pub async fn unlink(&self, user_id: i64) -> Result<(), Error> {
		sqlx::query("DELETE FROM adapter_links WHERE user_id = ?")
			.bind(user_id)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	/// Read one setting.
	pub async fn setting(&self, key: &str) -> Result<Option<String>, Error> {
		let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
			.bind(key)
			.fetch_optional(&self.pool)
			.await?;
		Ok(row.map(|(value,)| value))
	}

	/// Write one setting, replacing any previous value.
	pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), Error> {
		sqlx::query(
			"INSERT INTO settings (key, value) VALUES (?, ?)
			 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
		)
		.bind(key)
		.bind(value)
		.execute(&self.pool)
		.await?;
		Ok(())
	}

	/// Delete one setting.
	pub async fn delete_setting(&self, key: &str) -> Result<(), Error> {
		sqlx::query("DELETE FROM settings WHERE key = ?").bind(key).execute(&self.pool).await?;
		Ok(())
	}

	/// Add a host profile. The name must be new.
	pub async fn add_host_profile(&self, name: &str, profile: &HostConfig) -> Result<i64, Error> {
		let (existing,): (i64,) =
			sqlx::query_as("SELECT COUNT(*) FROM host_profiles WHERE name = ?")
				.bind(name)
				.fetch_one(&self.pool)
				.await?;
		if existing > 0 {
			return Err(Error::AlreadyExists(format!("host profile {name:?}")));
		}
		let result = sqlx::query(
			"INSERT INTO host_profiles (name, enabled, profile) VALUES (?, 1, ?)",
		)
		.bind(name)
		.bind(serde_json::to_string(profile)?)
		.execute(&self.pool)
		.await?;
		Ok(result.last_insert_rowid())
	}

	/// All host profiles, enabled ones first.
	pub async fn host_profiles(&self) -> Result<Vec<HostProfile>, Error> {
		let rows = sqlx::query(
			"SELECT id, name, enabled, profile FROM host_profiles
			 ORDER BY enabled DESC, id",
		)
		.fetch_all(&self.pool)
		.await?;
		rows.into_iter().map(profile_from_row).collect()
	}

	/// Enable or disable a host profile.
	pub async fn set_host_profile_enabled(&self, name: &str, enabled: bool) -> Result<(), Error> {
		sqlx::query("UPDATE host_profiles SET enabled = ? WHERE name = ?")
			.bind(enabled)
			.bind(name)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	/// Delete a host profile.
	pub async fn remove_host_profile(&self, name: &str) -> Result<(), Error> {
		sqlx::query("DELETE FROM host_profiles WHERE name = ?")
			.bind(name)
			.execute(&self.pool)
			.await?;
		Ok(())
	}

	/// Clear the local password of every directory-linked user.
	///
	/// Returns the number of rows that actually changed.
	pub async fn scrub_passwords(&self) -> Result<u64, Error> {
		let now = OffsetDateTime::now_utc().unix_timestamp();
		let result = sqlx::query(
			"UPDATE users SET password = '', updated_at = ?
			 WHERE password != ''
			   AND id IN (SELECT user_id FROM adapter_links)",
		)
		.bind(now)
		.execute(&self.pool)
		.await?;
		Ok(result.rows_affected())
	}

	/// Number of rows [`SqliteStore::scrub_passwords`] would change.
	pub async fn count_scrubbable(&self) -> Result<i64, Error> {
		let (count,): (i64,) = sqlx::query_as(
			"SELECT COUNT(*) FROM users
			 WHERE password != ''
			   AND id IN (SELECT user_id FROM adapter_links)",
		)
		.fetch_one(&self.pool)
		.await?;
		Ok(count)
	}
}

/// Encode the attributes map as its JSON row form, `None` when empty.
fn encode_attributes(attributes: &HashMap<String, Vec<String>>) -> Result<Option<String>, Error> {
	if attributes.is_empty() {
		return Ok(None);
	}
	Ok(Some(serde_json::to_string(attributes)?))
}

/// Decode a user row.
fn user_from_row(row: SqliteRow) -> Result<StoredUser, Error> {
	let attributes: Option<String> = row.try_get("attributes")?;
	let attributes = match attributes {
		Some(json) => serde_json::from_str(&json)?,
		None => HashMap::new(),
	};
	Ok(StoredUser {
		id: row.try_get("id")?,
		username: row.try_get("username")?,
		name: row.try_get("name")?,
		email: row.try_get("email")?,
		password: row.try_get("password")?,
		enabled: row.try_get("enabled")?,
		attributes,
		created_at: timestamp(row.try_get("created_at")?)?,
		updated_at: timestamp(row.try_get("updated_at")?)?,
	})
}

/// Decode a link row.
fn link_from_row(row: SqliteRow) -> Result<AdapterLink, Error> {
	Ok(AdapterLink {
		user_id: row.try_get("user_id")?,
		host: row.try_get("host")?,
		dn: row.try_get("dn")?,
		last_seen: timestamp(row.try_get("last_seen")?)?,
	})
}

/// Decode a host profile row.
fn profile_from_row(row: SqliteRow) -> Result<HostProfile, Error> {
	let profile: String = row.try_get("profile")?;
	Ok(HostProfile {
		id: row.try_get("id")?,
		name: row.try_get("name")?,
		enabled: row.try_get("enabled")?,
		profile: serde_json::from_str(&profile)?,
	})
}

/// Convert a stored unix timestamp back to [`OffsetDateTime`].
fn timestamp(secs: i64) -> Result<OffsetDateTime, Error> {
	OffsetDateTime::from_unix_timestamp(secs)
		.map_err(|err| Error::Invalid(format!("timestamp out of range: {err}")))
}

impl UserFields {
	/// The fields sync derives from a directory record. An absent enabled
	/// flag counts as enabled.
	#[must_use]
	pub fn from_record(record: &UserRecord) -> Self {
		UserFields {
			username: record.username.clone(),
			name: record.name.clone(),
			email: record.email.clone(),
			enabled: record.enabled.unwrap_or(true),
			attributes: record.attributes.clone(),
		}
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::collections::HashMap;

	use time::OffsetDateTime;

	use super::{SqliteStore, UserFields};
	use crate::error::Error;

	/// Minimal fields for one user.
	fn fields(username: &str) -> UserFields {
		UserFields {
			username: username.to_owned(),
			name: Some(format!("{username} example")),
			email: Some(format!("{username}@example.org")),
			enabled: true,
			attributes: HashMap::from([(
				"telephoneNumber".to_owned(),
				vec!["+49 30 1234".to_owned()],
			)]),
		}
	}

	#[tokio::test]
	async fn users_round_trip() {
		let store = SqliteStore::in_memory().await.unwrap();
		let id = store.insert_user(&fields("alice")).await.unwrap();

		let row = store.user_by_username("alice").await.unwrap().unwrap();
		assert_eq!(row.id, id);
		assert_eq!(row.email.as_deref(), Some("alice@example.org"));
		assert!(row.enabled);
		assert!(row.password.is_empty());
		assert!(row.matches(&fields("alice")));
		assert_eq!(row.attributes["telephoneNumber"], ["+49 30 1234"]);

		let mut changed = fields("alice");
		changed.email = Some("new@example.org".to_owned());
		assert!(!row.matches(&changed));
		store.update_user(id, &changed).await.unwrap();
		let row = store.user_by_username("alice").await.unwrap().unwrap();
		assert!(row.matches(&changed));

		assert_eq!(store.count_users().await.unwrap(), 1);
		store.delete_user(id).await.unwrap();
		assert_eq!(store.count_users().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn links_follow_their_user() {
		let store = SqliteStore::in_memory().await.unwrap();
		let id = store.insert_user(&fields("alice")).await.unwrap();
		let seen = OffsetDateTime::now_utc();
		store
			.link(id, "primary", "uid=alice,ou=People,dc=example,dc=org", seen)
			.await
			.unwrap();

		let link = store.link_for(id).await.unwrap().unwrap();
		assert_eq!(link.host, "primary");
		assert_eq!(link.last_seen.unix_timestamp(), seen.unix_timestamp());
		assert_eq!(store.links_on("primary").await.unwrap().len(), 1);
		assert!(store.links_on("fallback").await.unwrap().is_empty());

		// Re-linking moves the entry instead of failing.
		store.link(id, "fallback", "uid=alice,ou=Staff,dc=example,dc=org", seen).await.unwrap();
		let link = store.link_for(id).await.unwrap().unwrap();
		assert_eq!(link.host, "fallback");

		// Deleting the user cascades onto the link.
		store.delete_user(id).await.unwrap();
		assert!(store.link_for(id).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn settings_overwrite_in_place() {
		let store = SqliteStore::in_memory().await.unwrap();
		assert!(store.setting("sync.last_host").await.unwrap().is_none());
		store.set_setting("sync.last_host", "primary").await.unwrap();
		store.set_setting("sync.last_host", "fallback").await.unwrap();
		assert_eq!(store.setting("sync.last_host").await.unwrap().as_deref(), Some("fallback"));
		store.delete_setting("sync.last_host").await.unwrap();
		assert!(store.setting("sync.last_host").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn host_profiles_enforce_unique_names() {
		let store = SqliteStore::in_memory().await.unwrap();
		let profile: crate::config::HostConfig = serde_yaml::from_str(
			r"
name: primary
url: ldap://ldap1.example.org
search:
  base_dn: ou=People,dc=example,dc=org
  user_query: '(uid=[username])'
attributes: {}
",
		)
		.unwrap();

		store.add_host_profile("primary", &profile).await.unwrap();
		let err = store.add_host_profile("primary", &profile).await.unwrap_err();
		assert!(matches!(err, Error::AlreadyExists(_)));

		let profiles = store.host_profiles().await.unwrap();
		assert_eq!(profiles.len(), 1);
		assert!(profiles[0].enabled);
		assert_eq!(profiles[0].profile.search.base_dn, "ou=People,dc=example,dc=org");

		store.set_host_profile_enabled("primary", false).await.unwrap();
		assert!(!store.host_profiles().await.unwrap()[0].enabled);

		store.remove_host_profile("primary").await.unwrap();
		assert!(store.host_profiles().await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn scrubbing_only_touches_linked_users_with_passwords() {
		let store = SqliteStore::in_memory().await.unwrap();
		let linked = store.insert_user(&fields("alice")).await.unwrap();
		let unlinked = store.insert_user(&fields("bob")).await.unwrap();
		let clean = store.insert_user(&fields("carol")).await.unwrap();
		let now = OffsetDateTime::now_utc();
		store.link(linked, "primary", "uid=alice,ou=People,dc=example,dc=org", now).await.unwrap();
		store.link(clean, "primary", "uid=carol,ou=People,dc=example,dc=org", now).await.unwrap();

		store.set_password(linked, "$2y$legacy").await.unwrap();
		store.set_password(unlinked, "$2y$local").await.unwrap();

		assert_eq!(store.count_scrubbable().await.unwrap(), 1);
		assert_eq!(store.scrub_passwords().await.unwrap(), 1);
		assert_eq!(store.count_scrubbable().await.unwrap(), 0);

		// The unlinked user keeps their local password.
		let bob = store.user_by_username("bob").await.unwrap().unwrap();
		assert_eq!(bob.password, "$2y$local");
		let alice = store.user_by_username("alice").await.unwrap().unwrap();
		assert!(alice.password.is_empty());
	}
}
