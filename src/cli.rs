//! # Commandline parsing
//!
//! The CLI is exported as a library entry point so the thin binary (and
//! tests) can drive it via [`run_from_iter`].

use std::ffi::OsString;

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;

use crate::push::{self, PushConfig};
use crate::repo::Repo;
use crate::server::{self, AppState};
use crate::token::{self, TokenConfig};

/// Options for generating an API token.
#[derive(Debug, Parser)]
pub(crate) struct GenTokenOpts {
    /// Path to the configuration file
    #[clap(long, short = 'c', default_value = token::DEFAULT_CONFIG)]
    config: Utf8PathBuf,

    /// More messages
    #[clap(long, short = 'v')]
    verbose: bool,
}

/// Options for running the receiving server.
#[derive(Debug, Parser)]
pub(crate) struct ReceiveOpts {
    /// Path to the configuration file
    #[clap(long, short = 'c', default_value = token::DEFAULT_CONFIG)]
    config: Utf8PathBuf,

    /// Path to the repository
    #[clap(long, short = 'r', default_value = "repo")]
    repo: Utf8PathBuf,

    /// Host name and port to bind
    #[clap(long, short = 'a', default_value = ":8080")]
    address: String,

    /// More messages
    #[clap(long, short = 'v')]
    verbose: bool,
}

/// Options for pushing to a receiver.
#[derive(Debug, Parser)]
pub(crate) struct PushOpts {
    /// URL of the receiving server
    #[clap(long, short = 'a', default_value = "http://localhost:8080")]
    address: String,

    /// Path to the repository
    #[clap(long, short = 'r', default_value = "repo")]
    repo: Utf8PathBuf,

    /// Token to authenticate with the server
    #[clap(long, short = 't')]
    token: String,

    /// Branch to upload (default: all local branches)
    #[clap(long, short = 'b')]
    branch: Vec<String>,

    /// Prune the local repository before the transfer
    #[clap(long)]
    prune: bool,

    /// More messages
    #[clap(long, short = 'v')]
    verbose: bool,
}

/// Transfer local OSTree commits to a remote repository.
#[derive(Debug, Parser)]
#[clap(name = "ostree-publish", version)]
pub(crate) enum Opt {
    /// Create a new API token
    #[clap(name = "gentoken")]
    GenToken(GenTokenOpts),
    /// Start the receiving server
    Receive(ReceiveOpts),
    /// Push commits to a remote repository
    Push(PushOpts),
}

/// Initialize logging to stderr; `RUST_LOG` overrides the default level.
fn initialize_tracing(verbose: bool) {
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let default = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_from_opt(opt: Opt) -> Result<()> {
    match opt {
        Opt::GenToken(o) => {
            initialize_tracing(o.verbose);
            let token = token::append_new_token(&o.config)?;
            println!("{}", token.token);
            Ok(())
        }
        Opt::Receive(o) => {
            initialize_tracing(o.verbose);
            let tokens = TokenConfig::load(&o.config)?;
            if tokens.tokens.is_empty() {
                tracing::warn!("No tokens configured; all requests will be rejected");
            }
            let repo = Repo::open(&o.repo)?;
            let state = AppState::new(repo, tokens)?;
            server::serve(&o.address, state).await
        }
        Opt::Push(o) => {
            initialize_tracing(o.verbose);
            push::run(PushConfig {
                address: o.address,
                repo: o.repo,
                token: o.token,
                branches: o.branch,
                prune: o.prune,
            })
            .await
        }
    }
}

/// Parse the provided arguments and execute.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args)).await
}
