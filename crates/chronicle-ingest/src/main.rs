//! The chronicle command: drive archive operations from the terminal.
//!
//! Data-source adapters are separate crates; a distribution of this
//! binary links the adapters it supports, registers them at startup
//! (before the archive is opened), and gains their account types for
//! free. The engine itself runs fine with no adapters compiled in; it
//! just has no sources to pull from.
//!
//! # Usage
//!
//! ```bash
//! # Store an account (runs the source's authentication)
//! chronicle add-account photo_service/alice
//!
//! # Pull everything, then again incrementally
//! chronicle get-all photo_service/alice
//! chronicle get-latest photo_service/alice
//!
//! # Import a local export file
//! chronicle import takeout.tgz photo_service/alice
//!
//! # Merge a second listing of the same content into existing rows
//! chronicle get-all --soft-merge --prefer-new text,meta photo_service/alice
//! ```
//!
//! # Graceful shutdown
//!
//! Ctrl-C cancels the in-flight listing; workers drain, checkpoints
//! survive, and the next run resumes where this one stopped.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use chronicle_ingest::auth::{set_oauth2_app_source, StaticTokenSource, TokenSource};
use chronicle_ingest::{
    Archive, MergeOptions, ProcessingOptions, Session, Timeframe,
};

/// Personal content archive engine.
#[derive(Parser, Debug)]
#[command(name = "chronicle")]
#[command(about = "Aggregate your content from online services into a local archive")]
#[command(version)]
struct Cli {
    /// Path to the archive repository folder
    #[arg(long, default_value = "./chronicle_repo")]
    repo: PathBuf,

    /// Path to the config file to load
    #[arg(long, default_value = "chronicle.toml")]
    config: PathBuf,

    /// If > 0, retry a failed account operation at most this many times
    #[arg(long, default_value_t = 0)]
    max_retries: u32,

    /// Seconds to wait between retries
    #[arg(long, default_value_t = 30)]
    retry_after: u64,

    /// When finishing, delete items not found on the source
    /// (get-all or import only)
    #[arg(long)]
    prune: bool,

    /// Verify data files against their recorded hashes and reprocess
    /// mismatches (get-all or import only)
    #[arg(long)]
    integrity: bool,

    /// Reprocess every listed item that has not been modified locally
    /// (get-all or import only)
    #[arg(long)]
    reprocess: bool,

    /// Merge incoming items into existing rows matched by timestamp plus
    /// text, filename, or hash
    #[arg(long)]
    soft_merge: bool,

    /// Comma-separated fields whose incoming value wins in a soft merge:
    /// id,text,file,meta
    #[arg(long, value_delimiter = ',')]
    prefer_new: Vec<String>,

    /// Timeframe start (YYYY/MM/DD, or relative like -720h or -30d)
    #[arg(long)]
    start: Option<String>,

    /// Timeframe end (YYYY/MM/DD, or relative like -24h)
    #[arg(long)]
    end: Option<String>,

    /// Verbose adapter output
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Authenticate accounts and store them in the archive
    AddAccount {
        /// Accounts as data_source_id/user_id
        accounts: Vec<String>,
    },
    /// Pull only the most recent items for each account
    GetLatest {
        accounts: Vec<String>,
    },
    /// Pull everything each account's source offers
    GetAll {
        accounts: Vec<String>,
    },
    /// Process a locally-stored archive or export file
    Import {
        filename: PathBuf,
        account: String,
    },
}

impl Cli {
    fn processing_options(&self) -> Result<ProcessingOptions> {
        let mut merge = MergeOptions {
            soft: self.soft_merge,
            ..Default::default()
        };
        for field in &self.prefer_new {
            match field.as_str() {
                "" => {}
                "id" => merge.prefer_new_id = true,
                "text" => merge.prefer_new_data_text = true,
                "file" => merge.prefer_new_data_file = true,
                "meta" => merge.prefer_new_metadata = true,
                other => bail!("unrecognized --prefer-new field: '{other}'"),
            }
        }

        Ok(ProcessingOptions {
            reprocess: self.reprocess,
            prune: self.prune,
            integrity: self.integrity,
            timeframe: parse_timeframe(self.start.as_deref(), self.end.as_deref())?,
            merge,
            verbose: self.verbose,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().expect("static directive parses"))
                .add_directive("chronicle_ingest=debug".parse().expect("static directive parses")),
        )
        .init();

    let cli = Cli::parse();

    let config = load_config(&cli.config)
        .with_context(|| format!("loading config file {}", cli.config.display()))?;
    if let Some(oauth2) = config.and_then(|c| c.oauth2) {
        install_oauth2(oauth2)?;
    }

    let options = cli.processing_options()?;

    // Built-in sources; adapter crates linked into a distribution
    // register theirs here too, before the archive opens.
    chronicle_ingest::source::jsonl::register()?;

    let archive = Archive::open(&cli.repo)
        .with_context(|| format!("opening archive at {}", cli.repo.display()))?;

    // Ctrl-C cancels in-flight listings; checkpoints make the next run
    // pick up where this one stopped.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received; draining in-flight work...");
                cancel.cancel();
            }
        });
    }

    let retry_after = Duration::from_secs(cli.retry_after);
    let ok = match &cli.command {
        Command::AddAccount { accounts } => {
            for spec in parse_accounts(accounts)? {
                archive
                    .add_account(&spec.data_source_id, &spec.user_id)
                    .with_context(|| format!("adding account {}/{}", spec.data_source_id, spec.user_id))?;
            }
            true
        }

        Command::GetLatest { accounts } => {
            if options.reprocess || options.prune || options.integrity || cli.start.is_some() {
                bail!("get-latest does not support --reprocess, --prune, --integrity, or --start");
            }
            let specs = parse_accounts(accounts)?;
            run_accounts(&archive, specs, &cancel, cli.max_retries, retry_after, {
                let options = options.clone();
                move |session, cancel| {
                    let options = options.clone();
                    async move { session.get_latest(cancel, options).await }
                }
            })
            .await
        }

        Command::GetAll { accounts } => {
            let specs = parse_accounts(accounts)?;
            run_accounts(&archive, specs, &cancel, cli.max_retries, retry_after, {
                let options = options.clone();
                move |session, cancel| {
                    let options = options.clone();
                    async move { session.get_all(cancel, options).await }
                }
            })
            .await
        }

        Command::Import { filename, account } => {
            let specs = parse_accounts(std::slice::from_ref(account))?;
            let filename = filename.clone();
            run_accounts(&archive, specs, &cancel, cli.max_retries, retry_after, {
                let options = options.clone();
                move |session, cancel| {
                    let options = options.clone();
                    let filename = filename.clone();
                    async move { session.import(cancel, filename, options).await }
                }
            })
            .await
        }
    };

    archive.close();

    if !ok {
        bail!("one or more account operations failed");
    }
    Ok(())
}

/// Run one operation per account concurrently, retrying transient
/// failures with a fixed backoff. Returns whether every account
/// succeeded.
async fn run_accounts<F, Fut>(
    archive: &Arc<Archive>,
    accounts: Vec<AccountSpec>,
    cancel: &CancellationToken,
    max_retries: u32,
    retry_after: Duration,
    op: F,
) -> bool
where
    F: Fn(Arc<Session>, CancellationToken) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = chronicle_ingest::Result<()>> + Send + 'static,
{
    if accounts.is_empty() {
        tracing::error!("No accounts specified (expecting one or more 'data_source_id/user_id')");
        return false;
    }

    let mut tasks = Vec::with_capacity(accounts.len());
    for spec in accounts {
        let session = match archive.new_session(&spec.data_source_id, &spec.user_id) {
            Ok(session) => session,
            Err(err) => {
                tracing::error!(
                    "[{}/{}] Creating data source client: {}",
                    spec.data_source_id,
                    spec.user_id,
                    err
                );
                return false;
            }
        };

        let cancel = cancel.clone();
        let op = op.clone();
        tasks.push(tokio::spawn(async move {
            for attempt in 0..=max_retries {
                if attempt > 0 {
                    tracing::info!(
                        "[{}/{}] Retrying (attempt {}/{})",
                        session.data_source_id(),
                        session.user_id(),
                        attempt,
                        max_retries
                    );
                }

                match op(Arc::clone(&session), cancel.child_token()).await {
                    Ok(()) => return true,
                    Err(err) => {
                        tracing::error!(
                            "[{}/{}] {}",
                            session.data_source_id(),
                            session.user_id(),
                            err
                        );
                        if !err.is_transient() || cancel.is_cancelled() {
                            return false;
                        }
                        if attempt < max_retries && !retry_after.is_zero() {
                            tokio::time::sleep(retry_after).await;
                        }
                    }
                }
            }
            false
        }));
    }

    let mut ok = true;
    for task in tasks {
        ok &= task.await.unwrap_or(false);
    }
    ok
}

#[derive(Debug, Clone)]
struct AccountSpec {
    data_source_id: String,
    user_id: String,
}

fn parse_accounts(args: &[String]) -> Result<Vec<AccountSpec>> {
    let mut specs = Vec::with_capacity(args.len());
    for arg in args {
        let Some((source, user)) = arg.split_once('/') else {
            bail!("malformed account identifier '{arg}': expecting 'data_source_id/user_id'");
        };
        if source.is_empty() || user.is_empty() {
            bail!("malformed account identifier '{arg}': expecting 'data_source_id/user_id'");
        }
        specs.push(AccountSpec {
            data_source_id: source.to_string(),
            user_id: user.to_string(),
        });
    }
    Ok(specs)
}

/// Parse `--start`/`--end` values: absolute `YYYY/MM/DD` dates or
/// durations relative to now like `-720h` or `-30d`.
fn parse_timeframe(start: Option<&str>, end: Option<&str>) -> Result<Timeframe> {
    let since = start.map(parse_time_value).transpose()?;
    let until = end.map(parse_time_value).transpose()?;

    if let (Some(since), Some(until)) = (since, until) {
        if until <= since {
            bail!("timeframe end must be after start (start={since} end={until})");
        }
    }

    Ok(Timeframe {
        since,
        until,
        ..Default::default()
    })
}

fn parse_time_value(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y/%m/%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .context("date has no midnight")?;
        return Ok(midnight.and_utc());
    }

    let (number, unit) = value.split_at(value.len().saturating_sub(1));
    let count: i64 = number
        .parse()
        .with_context(|| format!("bad timeframe value '{value}': expecting YYYY/MM/DD or a relative duration like -720h"))?;
    let delta = match unit {
        "h" => chrono::Duration::hours(count),
        "d" => chrono::Duration::days(count),
        "m" => chrono::Duration::minutes(count),
        _ => bail!("bad timeframe unit in '{value}': expecting h, d, or m"),
    };
    Ok(Utc::now() + delta)
}

// ═══════════════════════════════════════════════════════════════════════════
// Config file
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct CommandConfig {
    oauth2: Option<OAuth2Config>,
}

#[derive(Debug, Deserialize)]
struct OAuth2Config {
    #[serde(default)]
    providers: std::collections::HashMap<String, ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)] // the full application shape is part of the file format
struct ProviderConfig {
    client_id: String,
    client_secret: String,
    #[serde(default)]
    auth_url: String,
    #[serde(default)]
    token_url: String,
    /// A pre-obtained authorization blob (base64), captured out of band.
    #[serde(default)]
    token: Option<String>,
}

/// Load the TOML config; a missing file is fine.
fn load_config(path: &PathBuf) -> Result<Option<CommandConfig>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(toml::from_str(&raw)?))
}

/// Install the per-provider OAuth2 application hook from the config.
fn install_oauth2(config: OAuth2Config) -> Result<()> {
    let providers = config.providers;
    set_oauth2_app_source(move |provider_id, _scopes| {
        let provider = providers
            .get(provider_id)
            .ok_or_else(|| anyhow::anyhow!("unsupported OAuth2 provider: {provider_id}"))?;
        let token = provider
            .token
            .as_deref()
            .map(|t| BASE64.decode(t))
            .transpose()
            .context("decoding configured token blob")?;
        Ok(Box::new(StaticTokenSource::new(token)) as Box<dyn TokenSource>)
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accounts() {
        let specs =
            parse_accounts(&["svc/alice".to_string(), "other/bob".to_string()]).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].data_source_id, "svc");
        assert_eq!(specs[1].user_id, "bob");

        assert!(parse_accounts(&["missing-slash".to_string()]).is_err());
        assert!(parse_accounts(&["/nouser".to_string()]).is_err());
    }

    #[test]
    fn test_parse_timeframe_absolute() {
        let tf = parse_timeframe(Some("2023/01/01"), Some("2023/06/30")).unwrap();
        assert!(tf.since.unwrap() < tf.until.unwrap());
        assert_eq!(tf.since.unwrap().timestamp(), 1672531200);
    }

    #[test]
    fn test_parse_timeframe_relative() {
        let tf = parse_timeframe(Some("-720h"), None).unwrap();
        let since = tf.since.unwrap();
        assert!(since < Utc::now());
        assert!(tf.until.is_none());
    }

    #[test]
    fn test_parse_timeframe_rejects_inverted() {
        assert!(parse_timeframe(Some("2023/06/30"), Some("2023/01/01")).is_err());
    }

    #[test]
    fn test_parse_time_value_rejects_garbage() {
        assert!(parse_time_value("yesterday").is_err());
        assert!(parse_time_value("-10x").is_err());
    }

    #[test]
    fn test_config_parses() {
        let raw = r#"
            [oauth2.providers.google]
            client_id = "id"
            client_secret = "secret"
            auth_url = "https://example.com/auth"
            token_url = "https://example.com/token"
        "#;
        let config: CommandConfig = toml::from_str(raw).unwrap();
        let oauth2 = config.oauth2.unwrap();
        assert!(oauth2.providers.contains_key("google"));
        assert!(oauth2.providers["google"].token.is_none());
    }
}
