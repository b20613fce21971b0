//! `dev`: command-line development agent.
//!
//! Drives an OpenAI-compatible chat endpoint through the Markdown tool
//! envelope, executing the declared tools against the local filesystem and
//! shell until the model declares completion and the audit pass agrees.

use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dev_agent::agent::{AgentLoop, Mode};
use dev_agent::config::Config;
use dev_agent::llm::HttpModelClient;
use dev_agent::session::{Session, SessionStore};

#[derive(Parser)]
#[command(
    name = "dev",
    version,
    about = "LLM development agent for the current directory"
)]
struct Cli {
    /// Run one automated task and exit (disables ASK_USER)
    #[arg(short = 'p', long = "prompt", value_name = "PROMPT")]
    prompt: Option<String>,

    /// Resume the last session for the current directory
    #[arg(long, conflicts_with = "session")]
    resume: bool,

    /// Resume a specific session by id
    #[arg(long, value_name = "UUID")]
    session: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect stored sessions
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
    /// Open the config file, or get/set a single value
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
    /// First-run configuration wizard
    Setup,
}

#[derive(Subcommand)]
enum SessionsAction {
    /// List recent sessions, newest first
    List,
    /// Search session transcripts for a substring
    Search { query: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print one config value
    Get { key: String },
    /// Set one config value
    Set { key: String, value: String },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    if let Err(err) = run().await {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Clap exits with 2 on usage errors by default; the contract is 1 for
    // every fatal condition (help/version stay 0).
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e)
            if matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            let _ = e.print();
            return Ok(());
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    match cli.command {
        Some(Command::Setup) => {
            let config = setup_wizard()?;
            config.save()?;
            println!("Config written to {}", Config::config_path()?.display());
            return Ok(());
        }
        Some(Command::Config { action }) => return run_config(action),
        Some(Command::Sessions { action }) => {
            let store = default_store()?;
            // The retention sweep runs at CLI startup whenever a config is
            // available to say how long sessions live.
            if Config::exists() {
                let config = Config::load()?;
                store.purge_expired(config.session_retention_days)?;
            }
            return run_sessions(&store, action);
        }
        None => {}
    }

    // Run mode. A missing config file triggers the wizard first.
    let config = if Config::exists() {
        Config::load()?
    } else {
        let config = setup_wizard()?;
        config.save()?;
        println!("Config written to {}", Config::config_path()?.display());
        config
    };

    let store = default_store()?;
    let purged = store.purge_expired(config.session_retention_days)?;
    if purged > 0 {
        debug!("Retention sweep removed {} session(s)", purged);
    }

    let working_dir = std::env::current_dir().context("Cannot determine current directory")?;
    let client = HttpModelClient::new(&config)?;

    if cli.resume || cli.session.is_some() {
        let id = match cli.session {
            Some(id) => id,
            None => store
                .last_session_for(&working_dir)?
                .ok_or_else(|| anyhow::anyhow!("No previous session for this directory"))?,
        };
        let mut session = store
            .load(&id)?
            .ok_or_else(|| anyhow::anyhow!("Session not found: {}", id))?;
        println!("Resumed: {}", session.id);

        return match cli.prompt {
            Some(prompt) => {
                session
                    .history
                    .push(dev_agent::session::ChatMessage::user(prompt.as_str()));
                run_automated(&config, &client, &store, &mut session).await
            }
            None => run_interactive(&config, &client, &store, &mut session, false).await,
        };
    }

    match cli.prompt {
        Some(prompt) => {
            let mut session = Session::new(working_dir, prompt.clone());
            session
                .history
                .push(dev_agent::session::ChatMessage::user(prompt.as_str()));
            println!("Session: {}", session.id);
            run_automated(&config, &client, &store, &mut session).await
        }
        None => {
            let Some(first) = read_prompt("What should I work on? ")? else {
                return Ok(());
            };
            let mut session = Session::new(working_dir, first.clone());
            session
                .history
                .push(dev_agent::session::ChatMessage::user(first.as_str()));
            println!("Session: {}", session.id);
            run_interactive(&config, &client, &store, &mut session, true).await
        }
    }
}

async fn run_automated(
    config: &Config,
    client: &HttpModelClient,
    store: &SessionStore,
    session: &mut Session,
) -> Result<()> {
    let agent = AgentLoop::new(config, client, store, Mode::Automated);
    let report = agent.run(session).await?;
    println!("\n{}", report.summary);
    Ok(())
}

async fn run_interactive(
    config: &Config,
    client: &HttpModelClient,
    store: &SessionStore,
    session: &mut Session,
    first_turn_pending: bool,
) -> Result<()> {
    let agent = AgentLoop::new(config, client, store, Mode::Interactive);

    if first_turn_pending {
        let report = agent.run(session).await?;
        println!("\n{}", report.summary);
    }

    loop {
        let Some(prompt) = read_prompt("\nNext task (blank to quit): ")? else {
            return Ok(());
        };
        session
            .history
            .push(dev_agent::session::ChatMessage::user(prompt.as_str()));
        let report = agent.run(session).await?;
        println!("\n{}", report.summary);
    }
}

/// Prompt on stdout, read one trimmed line. `None` on EOF or blank input.
fn read_prompt(prompt: &str) -> Result<Option<String>> {
    print!("{}", prompt);
    std::io::stdout().flush()?;

    let mut line = String::new();
    let read = std::io::stdin().lock().read_line(&mut line)?;
    if read == 0 {
        return Ok(None);
    }

    let line = line.trim().to_string();
    if line.is_empty() || line == "exit" || line == "quit" {
        Ok(None)
    } else {
        Ok(Some(line))
    }
}

fn default_store() -> Result<SessionStore> {
    Ok(SessionStore::new(Config::sessions_dir()?))
}

fn run_sessions(store: &SessionStore, action: SessionsAction) -> Result<()> {
    match action {
        SessionsAction::List => {
            let sessions = store.list()?;
            if sessions.is_empty() {
                println!("No sessions");
                return Ok(());
            }
            for session in sessions.iter().take(20) {
                println!(
                    "{} {}\n    {}",
                    &session.id[..8],
                    session.updated_at.format("%Y-%m-%d %H:%M"),
                    truncate(&session.original_prompt, 50)
                );
            }
        }
        SessionsAction::Search { query } => {
            let results = store.search(&query)?;
            if results.is_empty() {
                println!("No matches");
                return Ok(());
            }
            for result in results {
                println!(
                    "{} {} ({} match(es))\n    {}",
                    &result.id[..8],
                    result.updated_at.format("%Y-%m-%d %H:%M"),
                    result.match_count,
                    truncate(&result.prompt, 50)
                );
            }
        }
    }
    Ok(())
}

fn run_config(action: Option<ConfigAction>) -> Result<()> {
    match action {
        None => open_in_editor(&Config::config_path()?),
        Some(ConfigAction::Get { key }) => {
            let config = Config::load()?;
            println!("{}", config.get_value(&key)?);
            Ok(())
        }
        Some(ConfigAction::Set { key, value }) => {
            let mut config = Config::load()?;
            config.set_value(&key, &value)?;
            config.save()?;
            println!("{} = {}", key, config.get_value(&key)?);
            Ok(())
        }
    }
}

fn open_in_editor(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!(
            "No config file at {}. Run `dev setup` first.",
            path.display()
        );
    }

    if cfg!(target_os = "windows") {
        std::process::Command::new("cmd")
            .args(["/c", "start", ""])
            .arg(path)
            .status()?;
    } else if cfg!(target_os = "macos") {
        std::process::Command::new("open").arg(path).status()?;
    } else {
        let editor = std::env::var("VISUAL")
            .or_else(|_| std::env::var("EDITOR"))
            .unwrap_or_else(|_| "xdg-open".to_string());
        std::process::Command::new(editor).arg(path).status()?;
    }

    Ok(())
}

fn setup_wizard() -> Result<Config> {
    let mut config = Config::default();

    println!("dev-agent first-run setup (enter to keep defaults)\n");

    if let Some(url) = ask(&format!("API URL [{}]: ", config.api_url))? {
        config.api_url = url;
    }
    if let Some(key) = ask("API key (blank for none): ")? {
        config.api_key = key;
    }
    if let Some(model) = ask(&format!("Model [{}]: ", config.model))? {
        config.model = model;
    }

    Ok(config)
}

/// One wizard question; `None` means keep the default.
fn ask(prompt: &str) -> Result<Option<String>> {
    print!("{}", prompt);
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let line = line.trim();
    if line.is_empty() {
        Ok(None)
    } else {
        Ok(Some(line.to_string()))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let flattened: String = text
        .chars()
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect();
    if flattened.chars().count() > max_chars {
        let head: String = flattened.chars().take(max_chars).collect();
        format!("{}...", head)
    } else {
        flattened
    }
}
