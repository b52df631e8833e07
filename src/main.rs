//! Command line entry points: the sync cron job and store maintenance.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::{path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use ldap_bridge::{Authenticator, Config, Error, HostConfig, LdapClient, SqliteStore, SyncRunner};
use tracing_subscriber::EnvFilter;

/// Bridge a directory server to a local user table.
#[derive(Parser)]
#[command(name = "ldap-bridge", version, about)]
struct Cli {
	/// Path of the configuration file.
	#[arg(short, long, default_value = "bridge.yaml")]
	config: PathBuf,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Run one full sync pass per configured host. Intended to be run from
	/// cron.
	Sync,
	/// Clear the local passwords of directory-linked users, so stale local
	/// hashes cannot bypass the directory.
	ScrubPasswords {
		/// Only report how many rows would change.
		#[arg(long)]
		dry_run: bool,
	},
	/// Validate the configuration and try to reach every host.
	Check {
		/// Additionally resolve this user and print the record.
		#[arg(long)]
		user: Option<String>,
	},
}

#[tokio::main]
async fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	let cli = Cli::parse();
	match run(cli).await {
		Ok(code) => code,
		Err(err) => {
			eprintln!("error: {err} (code {})", err.code());
			ExitCode::FAILURE
		}
	}
}

/// Dispatch the parsed command line.
async fn run(cli: Cli) -> Result<ExitCode, Error> {
	let config = Config::load(&cli.config).await?;
	match cli.command {
		Command::Sync => {
			let store = SqliteStore::open(&config.store.path).await?;
			let summary = SyncRunner::new(config, store.clone()).run().await;
			for report in &summary.reports {
				println!("{report}");
				for failure in &report.errors {
					println!("  {}: {} (code {})", failure.dn, failure.message, failure.code);
				}
			}
			for failure in &summary.failures {
				println!("host {}: {} (code {})", failure.host, failure.message, failure.code);
			}
			let recorded =
				summary.reports.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
			store.set_setting("last_sync", &recorded).await?;
			Ok(if summary.is_complete() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
		}
		Command::ScrubPasswords { dry_run } => {
			let store = SqliteStore::open(&config.store.path).await?;
			if dry_run {
				let count = store.count_scrubbable().await?;
				println!("{count} stored passwords would be cleared");
			} else {
				let count = store.scrub_passwords().await?;
				println!("{count} stored passwords cleared");
			}
			Ok(ExitCode::SUCCESS)
		}
		Command::Check { user } => {
			let mut healthy = true;
			for host in &config.hosts {
				match check_host(host).await {
					Ok(()) => println!("host {}: ok", host.name),
					Err(err) => {
						healthy = false;
						println!("host {}: {err} (code {})", host.name, err.code());
					}
				}
			}
			if let Some(username) = user {
				match Authenticator::new(config).lookup(&username).await {
					Ok(found) => println!(
						"user {}: {} <{}> on {} with roles {:?}",
						found.record.username,
						found.record.name.as_deref().unwrap_or("-"),
						found.record.email.as_deref().unwrap_or("-"),
						found.host,
						found.roles,
					),
					Err(err) => {
						healthy = false;
						let reason = err.reason();
						println!("user {username}: {reason} (code {})", reason.code());
					}
				}
			}
			Ok(if healthy { ExitCode::SUCCESS } else { ExitCode::FAILURE })
		}
	}
}

/// Connect to one host and verify the proxy bind.
async fn check_host(host: &HostConfig) -> Result<(), Error> {
	let mut client = LdapClient::connect(host).await?;
	let bound = client.proxy_bind(&host.bind).await;
	let closed = client.close().await;
	bound.and(closed)
}
