//! Batch synchronization of directory users into the local store.
//!
//! A sync visits every configured host in order and runs one full pass per
//! host: every entry the enumeration filter matches is upserted and linked,
//! entries that fail are counted and reported without stopping the pass,
//! and linked users the pass did not see are handled according to
//! [`OnMissing`]. A host whose pass cannot complete at all ends up in the
//! summary's failure list instead of aborting the other hosts.
use std::{
	fmt,
	time::{Duration, Instant},
};

use ldap3::{
	adapters::{Adapter, EntriesOnly, PagedResults},
	Scope, SearchEntry,
};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::{
	adapter::{UserAdapter, UserRecord},
	client::{close_quietly, LdapClient},
	config::{Config, HostConfig, OnMissing},
	error::Error,
	filter::{self, UserQuery, USERNAME_TOKEN},
	store::{SqliteStore, UserFields},
};

/// What one entry did to the store.
enum Applied {
	/// A new row was inserted.
	Created,
	/// An existing row was rewritten.
	Updated,
	/// The row already matched.
	Unchanged,
}

/// One entry the pass could not process.
#[derive(Clone, Debug)]
pub struct SyncFailure {
	/// Distinguished name of the entry.
	pub dn: String,
	/// Internal error code.
	pub code: u16,
	/// Human-readable reason.
	pub message: String,
}

/// The accounting of one full pass.
#[derive(Clone, Debug)]
pub struct SyncReport {
	/// Name of the host that was synced.
	pub host: String,
	/// Rows inserted.
	pub created: u64,
	/// Rows rewritten.
	pub updated: u64,
	/// Rows that already matched.
	pub unchanged: u64,
	/// Entries that could not be processed.
	pub failed: u64,
	/// Linked users the pass did not see.
	pub missing: u64,
	/// The failures, in pass order.
	pub errors: Vec<SyncFailure>,
	/// When the pass started.
	pub started: OffsetDateTime,
	/// How long the pass took.
	pub took: Duration,
}

impl SyncReport {
	/// An empty report for a pass starting now.
	fn begin(host: &str) -> Self {
		SyncReport {
			host: host.to_owned(),
			created: 0,
			updated: 0,
			unchanged: 0,
			failed: 0,
			missing: 0,
			errors: Vec::new(),
			started: OffsetDateTime::now_utc(),
			took: Duration::ZERO,
		}
	}

	/// Entries the pass handled, successfully or not.
	#[must_use]
	pub fn processed(&self) -> u64 {
		self.created + self.updated + self.unchanged + self.failed
	}

	/// Record one failure.
	fn fail(&mut self, dn: &str, err: &Error) {
		warn!(dn, code = err.code(), "skipping entry: {err}");
		self.failed += 1;
		self.errors.push(SyncFailure {
			dn: dn.to_owned(),
			code: err.code(),
			message: err.to_string(),
		});
	}
}

impl fmt::Display for SyncReport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"host {}: {} created, {} updated, {} unchanged, {} failed, {} missing ({} in {:?})",
			self.host,
			self.created,
			self.updated,
			self.unchanged,
			self.failed,
			self.missing,
			self.processed(),
			self.took
		)
	}
}

/// A host whose pass could not complete at all.
#[derive(Clone, Debug)]
pub struct HostFailure {
	/// Name of the configured host.
	pub host: String,
	/// Internal error code.
	pub code: u16,
	/// Human-readable reason.
	pub message: String,
}

/// The outcome of syncing every configured host.
#[derive(Clone, Debug, Default)]
pub struct SyncSummary {
	/// Reports of hosts whose pass completed, in configuration order.
	pub reports: Vec<SyncReport>,
	/// Hosts whose pass failed entirely.
	pub failures: Vec<HostFailure>,
}

impl SyncSummary {
	/// Whether every host's pass completed.
	#[must_use]
	pub fn is_complete(&self) -> bool {
		self.failures.is_empty()
	}
}

/// Runs full passes against the configured hosts.
#[derive(Clone, Debug)]
pub struct SyncRunner {
	/// The validated configuration.
	config: Config,
	/// The local store to sync into.
	store: SqliteStore,
}

impl SyncRunner {
	/// Create a runner over a validated configuration and an open store.
	#[must_use]
	pub fn new(config: Config, store: SqliteStore) -> Self {
		SyncRunner { config, store }
	}

	/// Run one full pass against every configured host, in order.
	pub async fn run(&self) -> SyncSummary {
		let mut summary = SyncSummary::default();
		for host in &self.config.hosts {
			match self.run_host(host).await {
				Ok(report) => summary.reports.push(report),
				Err(err) => {
					warn!(host = %host.name, code = err.code(), "sync failed: {err}");
					summary.failures.push(HostFailure {
						host: host.name.clone(),
						code: err.code(),
						message: err.to_string(),
					});
				}
			}
		}
		summary
	}

	/// Run one full pass against one host.
	async fn run_host(&self, host: &HostConfig) -> Result<SyncReport, Error> {
		let filter = enumeration_filter(host)?;
		let mut report = SyncReport::begin(&host.name);
		let clock = Instant::now();
		info!(host = %host.name, %filter, "starting directory sync");

		let mut client = LdapClient::connect(host).await?;
		let outcome: Result<(), Error> = async {
			client.proxy_bind(&host.bind).await?;

			// The stream drives its own handle so the adapter can run
			// lookups on the connection while entries arrive.
			let mut stream_ldap = client.ldap.clone();
			let mut adapter = UserAdapter::new(&mut client, host);
			let attrs = adapter.fetch_attrs();

			let mut adapters: Vec<Box<dyn Adapter<_, _>>> = vec![Box::new(EntriesOnly::new())];
			if let Some(page_size) = host.search.page_size {
				adapters.push(Box::new(PagedResults::new(page_size)));
			}
			let mut search = stream_ldap
				.streaming_search_with(
					adapters,
					&host.search.base_dn,
					Scope::Subtree,
					&filter,
					attrs,
				)
				.await?;

			while let Some(entry) = search.next().await?.map(SearchEntry::construct) {
				let seen = OffsetDateTime::now_utc();
				let applied = async {
					let record = adapter.record_from(&entry).await?;
					apply_record(&self.store, &host.name, &record, seen).await
				}
				.await;
				match applied {
					Ok(Applied::Created) => report.created += 1,
					Ok(Applied::Updated) => report.updated += 1,
					Ok(Applied::Unchanged) => report.unchanged += 1,
					Err(err) => report.fail(&entry.dn, &err),
				}
			}
			search.finish().await.success()?;
			Ok(())
		}
		.await;
		close_quietly(client, &host.name).await;
		outcome?;

		retire_missing(&self.store, host, self.config.sync.on_missing, &mut report).await;

		report.took = clock.elapsed();
		info!(host = %host.name, "finished directory sync: {report}");
		Ok(report)
	}
}

/// The filter that enumerates all users of a host.
///
/// The username token of the filter template turns into a wildcard. A host
/// looked up by DN template has nothing to enumerate with.
fn enumeration_filter(host: &HostConfig) -> Result<String, Error> {
	match &host.search.user_query {
		UserQuery::Filter(template) => Ok(filter::substitute(template, USERNAME_TOKEN, "*")),
		UserQuery::DnTemplate(_) => Err(Error::Config(format!(
			"host {:?} uses a DN template and cannot enumerate users",
			host.name
		))),
	}
}

/// Upsert one directory record and refresh its link.
async fn apply_record(
	store: &SqliteStore,
	host: &str,
	record: &UserRecord,
	seen: OffsetDateTime,
) -> Result<Applied, Error> {
	let fields = UserFields::from_record(record);
	match store.user_by_username(&record.username).await? {
		Some(row) => {
			let applied = if row.matches(&fields) {
				Applied::Unchanged
			} else {
				store.update_user(row.id, &fields).await?;
				Applied::Updated
			};
			store.link(row.id, host, &record.dn, seen).await?;
			Ok(applied)
		}
		None => {
			let id = store.insert_user(&fields).await?;
			store.link(id, host, &record.dn, seen).await?;
			Ok(Applied::Created)
		}
	}
}

/// Handle linked users of this host the pass did not see.
///
/// Timestamps are compared at second precision, matching how links are
/// stored.
async fn retire_missing(
	store: &SqliteStore,
	host: &HostConfig,
	on_missing: OnMissing,
	report: &mut SyncReport,
) {
	let links = match store.links_on(&host.name).await {
		Ok(links) => links,
		Err(err) => {
			report.fail(&host.name, &err);
			return;
		}
	};
	for link in links {
		if link.last_seen.unix_timestamp() >= report.started.unix_timestamp() {
			continue;
		}
		report.missing += 1;
		let handled = match on_missing {
			OnMissing::Ignore => Ok(()),
			OnMissing::Disable => store.set_user_enabled(link.user_id, false).await,
			OnMissing::Delete => store.delete_user(link.user_id).await,
		};
		if let Err(err) = handled {
			report.fail(&link.dn, &err);
		} else if on_missing != OnMissing::Ignore {
			info!(dn = %link.dn, action = ?on_missing, "retired a missing user");
		}
	}
}
