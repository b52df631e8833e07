//! Bridge a directory server to a local user table.
//!
//! The crate covers the three jobs a web application typically needs from
//! LDAP: verifying a login against one or more directory hosts (with
//! fallback across them), deciding whether a front-end-authenticated
//! request may be trusted for single sign-on, and periodically syncing the
//! directory's users into a local SQLite table that the application reads.
//!
//! For a general primer on LDAP, the [introduction] in the `ldap3` crate
//! which is used here for interfacing with LDAP is an excellent resource.
//! The site "firstyear's blog-a-log" also has [a guide][firstyear] which is
//! more visually oriented and goes into more detail about searching
//!
//! [introduction]: https://github.com/inejge/ldap3/blob/master/LDAP-primer.md
//! [firstyear]: https://fy.blackhats.net.au/blog/html/pages/ldap_guide_part_1_foundations.html
//!
//! # Getting started
//! A minimal example wiring the pieces together might look like so:
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use ldap_bridge::{Authenticator, Config, SqliteStore, SyncRunner};
//!
//! // Configuration is a YAML file listing the hosts in fallback order.
//! let config = Config::load("bridge.yaml").await?;
//! let store = SqliteStore::open(&config.store.path).await?;
//!
//! let auth = Authenticator::new(config.clone());
//! let user = auth.authenticate("alice", "secret").await?;
//! println!("{} holds roles {:?}", user.record.username, user.roles);
//!
//! let summary = SyncRunner::new(config, store).run().await;
//! for report in &summary.reports {
//! 	println!("{report}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Limitations
//! * Passwords are only verified with a simple bind. SASL mechanisms are
//!   not implemented.
//! * A sync is always a full pass. No controls such as [persistent search]
//!   or [content synchronization] are used to track changes incrementally.
//! * [secrecy](https://docs.rs/secrecy) is not used for storing the proxy
//!   password, it probably should be
//!
//! [persistent search]: https://datatracker.ietf.org/doc/html/draft-ietf-ldapext-psearch-03
//! [content synchronization]: https://www.rfc-editor.org/rfc/rfc4533.html

pub mod adapter;
pub mod auth;
pub mod client;
pub mod config;
pub mod dn;
pub mod entry;
pub mod error;
pub mod filter;
pub mod groups;
pub mod sso;
pub mod store;
pub mod sync;

pub use ldap3::{self, SearchEntry};

pub use crate::{
	adapter::{UserAdapter, UserRecord},
	auth::{AuthUser, Authenticator},
	client::LdapClient,
	config::{Config, HostConfig},
	dn::Dn,
	entry::SearchEntryExt,
	error::{AuthError, Error},
	sso::{SsoConfig, SsoRequest},
	store::SqliteStore,
	sync::{SyncReport, SyncRunner, SyncSummary},
};
