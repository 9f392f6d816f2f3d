#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use console::style;
use sbcli::auth::{self, UNAUTHORIZED_HINT};
use sbcli::config::{config_json_schema, resolve_config_dir, Config, LOG_FILE_ENV};
use sbcli::disposition::{Coordinator, Mode, Summary};
use sbcli::model::{EntityRef, SubQueue};
use sbcli::pager::{BrokerPageSource, PageSource, SequencePager};
use sbcli::transport::amqp::{AmqpBroker, AmqpConnector};
use sbcli::transport::Broker;
use sbcli::{render, sequence_expr, verify};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// `sbcli` - inspect and repair Service Bus entities by sequence number.
#[derive(Parser, Debug)]
#[command(name = "sbcli")]
#[command(version)]
#[command(about = "Peek, reject, resubmit and delete Service Bus messages by sequence number.", long_about = None)]
struct Cli {
    /// Directory holding config.toml (default: ~/.sbcli)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    /// Mirror log output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct EntityArgs {
    /// Namespace host (overrides broker.namespace)
    #[arg(long)]
    namespace: Option<String>,

    /// Queue name
    #[arg(long, conflicts_with_all = ["topic", "subscription"])]
    queue: Option<String>,

    /// Topic name (requires --subscription)
    #[arg(long, requires = "subscription")]
    topic: Option<String>,

    /// Subscription name (requires --topic)
    #[arg(long, requires = "topic")]
    subscription: Option<String>,

    /// The entity requires sessions
    #[arg(long)]
    session_enabled: bool,
}

impl EntityArgs {
    fn entity(&self) -> Result<EntityRef> {
        match (&self.queue, &self.topic, &self.subscription) {
            (Some(queue), None, None) => Ok(EntityRef::queue(queue.as_str(), self.session_enabled)),
            (None, Some(topic), Some(subscription)) => Ok(EntityRef::subscription(
                topic,
                subscription,
                self.session_enabled,
            )),
            _ => bail!("Select an entity with --queue or --topic plus --subscription"),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List a page of messages without locking them
    #[command(long_about = "\
List a page of messages without locking them.

Pages are addressed by sequence number. With --interactive the page stays \
open and accepts n (next), p (previous), j <seq> (jump), s <seq> (show) \
and q (quit).

Examples:
  sbcli peek --queue orders
  sbcli peek --queue orders --dlq --from 500 --count 50
  sbcli peek --topic events --subscription audit --session-enabled --session-prefix tenant-7")]
    Peek {
        #[command(flatten)]
        entity: EntityArgs,
        /// Read the dead-letter sub-queue
        #[arg(long)]
        dlq: bool,
        /// First sequence number to show
        #[arg(long)]
        from: Option<i64>,
        /// Page size (default: pager.page_size)
        #[arg(long)]
        count: Option<u32>,
        /// Only show sessions whose id starts with this prefix
        #[arg(long)]
        session_prefix: Option<String>,
        /// Keep paging interactively
        #[arg(short, long)]
        interactive: bool,
    },

    /// Print one message in full
    Show {
        #[command(flatten)]
        entity: EntityArgs,
        /// Read the dead-letter sub-queue
        #[arg(long)]
        dlq: bool,
        sequence: i64,
    },

    /// Dead-letter active messages
    #[command(long_about = "\
Dead-letter active messages.

EXPR lists sequence numbers and inclusive ranges, e.g. '514-590, 595'.

Examples:
  sbcli reject --queue orders 1042 --reason Poison --description 'bad schema'
  sbcli reject --queue orders --session-enabled --session abc '10-12'")]
    Reject {
        #[command(flatten)]
        entity: EntityArgs,
        expr: String,
        /// Session the messages belong to
        #[arg(long)]
        session: Option<String>,
        #[arg(long, default_value = "Rejected")]
        reason: String,
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Send dead-lettered messages back to their entity
    Resubmit {
        #[command(flatten)]
        entity: EntityArgs,
        expr: String,
        #[arg(long)]
        session: Option<String>,
    },

    /// Remove dead-lettered messages
    Delete {
        #[command(flatten)]
        entity: EntityArgs,
        expr: String,
        #[arg(long)]
        session: Option<String>,
    },

    /// Check a shared access connection string
    Verify {
        /// Connection string (default: broker.connection_string)
        #[arg(long)]
        connection_string: Option<String>,
    },

    /// Configuration utilities
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the config JSON schema
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Warning: Failed to install default crypto provider: {e:?}");
    }

    let cli = Cli::parse();

    // Schema output must stay clean for redirection; no config or logging.
    if let Commands::Config {
        config_command: ConfigCommands::Schema,
    } = &cli.command
    {
        println!("{}", config_json_schema()?);
        return Ok(());
    }

    let config_dir = resolve_config_dir(cli.config_dir.as_deref())?;
    let mut config = Config::load_or_init(&config_dir).await?;
    config.apply_env_overrides();
    if let Some(namespace) = entity_args(&cli.command).and_then(|e| e.namespace.clone()) {
        config.broker.namespace = Some(namespace);
    }
    config.validate()?;

    let log_path = init_logging(&config, &config_dir, cli.verbose)?;
    tracing::info!(log = %log_path.display(), "sbcli {}", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted");
            on_signal.cancel();
        }
    });

    let result = run(cli.command, config, &cancel).await;
    if let Err(err) = &result {
        tracing::error!("{err:#}");
        if auth::is_unauthorized(err) {
            eprintln!("{}", style(UNAUTHORIZED_HINT).yellow());
        }
    }
    result
}

fn entity_args(command: &Commands) -> Option<&EntityArgs> {
    match command {
        Commands::Peek { entity, .. }
        | Commands::Show { entity, .. }
        | Commands::Reject { entity, .. }
        | Commands::Resubmit { entity, .. }
        | Commands::Delete { entity, .. } => Some(entity),
        Commands::Verify { .. } | Commands::Config { .. } => None,
    }
}

/// `SBCLI_LOG_FILE` > `logging.file` > `<config dir>/logs/sbcli_<timestamp>.log`.
fn log_path(config: &Config, config_dir: &Path) -> PathBuf {
    if let Ok(path) = std::env::var(LOG_FILE_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Some(path) = &config.logging.file {
        return path.clone();
    }
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    config_dir.join("logs").join(format!("sbcli_{stamp}.log"))
}

fn init_logging(config: &Config, config_dir: &Path, verbose: bool) -> Result<PathBuf> {
    let path = log_path(config, config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    let level = config.logging.level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file_layer = fmt::layer()
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false);
    let stderr_layer = verbose.then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("Failed to install log subscriber")?;
    Ok(path)
}

async fn run(command: Commands, config: Config, cancel: &CancellationToken) -> Result<()> {
    match command {
        Commands::Peek {
            entity,
            dlq,
            from,
            count,
            session_prefix,
            interactive,
        } => {
            let entity = entity.entity()?;
            let sub_queue = if dlq {
                SubQueue::DeadLetter
            } else {
                SubQueue::Active
            };
            let page_size = count.unwrap_or(config.pager.page_size);
            let broker = open_broker(&config, cancel)?;
            let source = BrokerPageSource::new(broker.clone(), entity.address(sub_queue));
            let mut pager = SequencePager::new(source, page_size).with_session_prefix(session_prefix);

            let page = match from {
                Some(from) => pager.page_from(from).await?,
                None => pager.first_page().await?,
            };
            println!("{} ({} messages)", style(entity.address(sub_queue)).bold(), page.len());
            print!("{}", render::format_page(page));

            let result = if interactive {
                interactive_pager(&mut pager, cancel).await
            } else {
                Ok(())
            };
            broker.shutdown().await;
            result
        }

        Commands::Show {
            entity,
            dlq,
            sequence,
        } => {
            let entity = entity.entity()?;
            let sub_queue = if dlq {
                SubQueue::DeadLetter
            } else {
                SubQueue::Active
            };
            let broker = open_broker(&config, cancel)?;
            let source = BrokerPageSource::new(broker.clone(), entity.address(sub_queue));
            let found = source.find_by_sequence(sequence).await;
            broker.shutdown().await;
            match found? {
                Some(message) => {
                    println!("{}", render::format_message(&message));
                    Ok(())
                }
                None => bail!("Message #{sequence} not found in {}", entity.address(sub_queue)),
            }
        }

        Commands::Reject {
            entity,
            expr,
            session,
            reason,
            description,
        } => {
            let mode = Mode::Reject {
                reason,
                description,
            };
            dispose_command(&config, &entity, &expr, session, mode, cancel).await
        }

        Commands::Resubmit {
            entity,
            expr,
            session,
        } => dispose_command(&config, &entity, &expr, session, Mode::Resubmit, cancel).await,

        Commands::Delete {
            entity,
            expr,
            session,
        } => dispose_command(&config, &entity, &expr, session, Mode::Delete, cancel).await,

        Commands::Verify { connection_string } => {
            let connection_string = connection_string
                .or_else(|| config.broker.connection_string.clone())
                .context("No connection string (use --connection-string or SBCLI_CONNECTION_STRING)")?;
            let report = verify::verify_sas(
                &AmqpConnector,
                &connection_string,
                config.broker.port,
                Duration::from_secs(config.timeouts.verify_secs),
                cancel,
            )
            .await;
            if report.ok {
                println!("{} {}", style("✓").green().bold(), report.message);
                Ok(())
            } else {
                bail!(report.message)
            }
        }

        Commands::Config { .. } => Ok(()),
    }
}

fn open_broker(config: &Config, cancel: &CancellationToken) -> Result<Arc<AmqpBroker>> {
    Ok(Arc::new(AmqpBroker::new(
        config.broker_settings()?,
        config.credential()?,
        cancel.clone(),
    )))
}

async fn dispose_command(
    config: &Config,
    entity: &EntityArgs,
    expr: &str,
    session: Option<String>,
    mode: Mode,
    cancel: &CancellationToken,
) -> Result<()> {
    let entity = entity.entity()?;
    let selectors = sequence_expr::selectors(expr, session.as_deref());
    if selectors.is_empty() {
        bail!("No valid sequence numbers in '{expr}'");
    }

    let broker = open_broker(config, cancel)?;
    let address = entity.address(mode.source());
    let page = match broker.peek(&address, 1, config.pager.page_size).await {
        Ok(page) => page,
        Err(err) => {
            tracing::warn!(address, "head peek failed, batch sizes fall back to 1: {err}");
            Vec::new()
        }
    };

    let coordinator = Coordinator::new(
        broker.clone(),
        Arc::new(AmqpConnector),
        config.credential()?,
        config.coordinator_settings()?,
        cancel.clone(),
    );
    let summary = coordinator.dispose_all(&entity, &selectors, &mode, &page).await;
    broker.shutdown().await;

    print_summary(&summary, mode.verb());
    if summary.unauthorized {
        eprintln!("{}", style(UNAUTHORIZED_HINT).yellow());
    }
    if !summary.all_ok() {
        bail!(
            "{} of {} {} operations failed",
            summary.failed,
            summary.outcomes.len(),
            mode.verb()
        );
    }
    Ok(())
}

fn print_summary(summary: &Summary, verb: &str) {
    for outcome in &summary.outcomes {
        match &outcome.error {
            None => println!("{} {verb} {}", style("✓").green().bold(), outcome.selector),
            Some(error) => println!(
                "{} {verb} {}: {error}",
                style("✗").red().bold(),
                outcome.selector
            ),
        }
    }
    println!(
        "{} succeeded, {} failed",
        style(summary.succeeded).green(),
        style(summary.failed).red()
    );
}

async fn interactive_pager<S: PageSource>(
    pager: &mut SequencePager<S>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", style("[n]ext [p]rev [j]ump <seq> [s]how <seq> [q]uit >").dim());
        std::io::stdout().flush()?;

        let line = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            return Ok(());
        };
        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default();
        let argument = words.next().and_then(|w| w.parse::<i64>().ok());

        match (command, argument) {
            ("n" | "next", _) => {
                let page = pager.next_page().await?;
                if page.is_empty() {
                    println!("End of entity.");
                } else {
                    print!("{}", render::format_page(page));
                }
            }
            ("p" | "prev", _) => {
                if pager.can_go_back() {
                    let page = pager.prev_page().await?;
                    print!("{}", render::format_page(page));
                } else {
                    println!("Already at the first page.");
                }
            }
            ("j" | "jump", Some(sequence)) => match pager.jump_to(sequence).await? {
                Some(_) => print!("{}", render::format_page(pager.current())),
                None => println!("Sequence {sequence} not found."),
            },
            ("s" | "show", Some(sequence)) => {
                match pager.current().iter().find(|m| m.sequence_number == sequence) {
                    Some(message) => println!("{}", render::format_message(message)),
                    None => println!("Sequence {sequence} is not on this page."),
                }
            }
            ("q" | "quit", _) => return Ok(()),
            ("", _) => {}
            _ => println!("Unrecognized command."),
        }
    }
}
