//! tfsproxy CLI - Command line front end
//!
//! Loads the proxy configuration, drives one action through the protocol
//! engine against a live cluster and prints the outcome.

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tfsproxy_client::{ActionOutcome, ActionRequest, Engine, TcpTransport};
use tfsproxy_common::{ActionKind, ProxyConfig, ServerAddr, UnlinkType};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tfsproxy-cli")]
#[command(about = "Talk to a TFS cluster through the tfsproxy protocol engine")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "tfsproxy.toml")]
    config: PathBuf,

    /// Routing server, may be repeated (overrides upstream.rc_servers)
    #[arg(long = "rc-server", env = "TFSPROXY_RC_SERVERS", value_delimiter = ',', value_parser = parse_addr)]
    rc_servers: Vec<ServerAddr>,

    /// Static name server (overrides upstream.name_server)
    #[arg(long, env = "TFSPROXY_NAME_SERVER", value_parser = parse_addr)]
    name_server: Option<ServerAddr>,

    /// Application key presented at login
    #[arg(long, env = "TFSPROXY_APP_KEY")]
    app_key: Option<String>,

    /// Give up on the action after this many milliseconds
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Log level (overrides logging.level)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (overrides logging.format)
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum UnlinkMode {
    #[default]
    Delete,
    Undelete,
    Conceal,
    Reveal,
}

impl From<UnlinkMode> for UnlinkType {
    fn from(mode: UnlinkMode) -> Self {
        match mode {
            UnlinkMode::Delete => Self::Delete,
            UnlinkMode::Undelete => Self::Undelete,
            UnlinkMode::Conceal => Self::Conceal,
            UnlinkMode::Reveal => Self::Reveal,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Raw file operations (T/L file names)
    Raw {
        #[command(subcommand)]
        action: RawCommands,
    },
    /// Named file and directory operations
    Fs {
        /// Owner of the named files
        #[arg(short, long, default_value_t = 0)]
        user: u64,

        #[command(subcommand)]
        action: FsCommands,
    },
    /// Print the application id assigned at login
    AppId,
    /// Send one keepalive to the routing service
    Keepalive,
}

#[derive(Subcommand, Debug)]
enum RawCommands {
    /// Store a local file and print its new name
    Put {
        file: PathBuf,
        #[arg(long)]
        suffix: Option<String>,
        /// Store as a large file regardless of size
        #[arg(long)]
        large: bool,
        /// Return the name without suffix bits
        #[arg(long)]
        simple: bool,
    },
    /// Read a file
    Get {
        name: String,
        #[arg(long)]
        suffix: Option<String>,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        length: Option<u64>,
        /// Read deleted and concealed files too
        #[arg(long)]
        force: bool,
        /// Write the data here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show file information
    Stat {
        name: String,
        #[arg(long)]
        suffix: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Delete, undelete, conceal or reveal a file
    Rm {
        name: String,
        #[arg(long)]
        suffix: Option<String>,
        #[arg(long, value_enum, default_value_t = UnlinkMode::Delete)]
        mode: UnlinkMode,
    },
}

#[derive(Subcommand, Debug)]
enum FsCommands {
    /// Create a directory
    Mkdir {
        path: String,
        /// Create missing parents
        #[arg(short, long)]
        parents: bool,
    },
    /// Create an empty file
    Touch {
        path: String,
        #[arg(short, long)]
        parents: bool,
    },
    /// Remove an empty directory
    Rmdir { path: String },
    /// Move a file or directory
    Mv {
        from: String,
        to: String,
        /// Source is a directory
        #[arg(short, long)]
        dir: bool,
    },
    /// List a directory
    Ls { path: String },
    /// Show a file entry
    Stat { path: String },
    /// Write a local file into an existing named file
    Write {
        path: String,
        file: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
    },
    /// Read a named file
    Read {
        path: String,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        length: Option<u64>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Remove a named file and its data
    Rm { path: String },
}

fn parse_addr(s: &str) -> std::result::Result<ServerAddr, String> {
    s.parse().map_err(|e| format!("{e}"))
}

/// Read the configuration file, if any, and apply command line overrides
fn load_config(args: &Args) -> Result<ProxyConfig> {
    let mut config: ProxyConfig = if args.config.exists() {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("failed to read {}", args.config.display()))?;
        toml::from_str(&text).with_context(|| format!("failed to parse {}", args.config.display()))?
    } else {
        ProxyConfig::default()
    };

    if !args.rc_servers.is_empty() {
        config.upstream.rc_servers.clone_from(&args.rc_servers);
    }
    if let Some(addr) = args.name_server {
        config.upstream.name_server = Some(addr);
    }
    if let Some(key) = &args.app_key {
        config.upstream.app_key.clone_from(key);
    }
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = args.log_format {
        config.logging.format = match format {
            LogFormat::Text => "text".into(),
            LogFormat::Json => "json".into(),
        };
    }

    config.validate()?;
    Ok(config)
}

fn init_logging(config: &ProxyConfig) {
    let json = config.logging.format.eq_ignore_ascii_case("json");
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .init();
}

fn read_body(path: &Path) -> Result<Bytes> {
    let data = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(Bytes::from(data))
}

fn with_suffix(req: ActionRequest, suffix: Option<&String>) -> ActionRequest {
    match suffix {
        Some(suffix) => req.suffix(suffix.as_str()),
        None => req,
    }
}

/// Turn a subcommand into an engine request and the file its data goes to
fn build_request(command: &Commands) -> Result<(ActionRequest, Option<PathBuf>)> {
    let built = match command {
        Commands::AppId => (ActionRequest::raw(ActionKind::GetAppId), None),
        Commands::Keepalive => (ActionRequest::raw(ActionKind::KeepAlive), None),
        Commands::Raw { action } => match action {
            RawCommands::Put { file, suffix, large, simple } => {
                let mut req = with_suffix(ActionRequest::raw(ActionKind::WriteFile), suffix.as_ref())
                    .body(read_body(file)?);
                if *large {
                    req = req.large();
                }
                if *simple {
                    req = req.simple();
                }
                (req, None)
            }
            RawCommands::Get { name, suffix, offset, length, force, output } => {
                let mut req = with_suffix(ActionRequest::raw(ActionKind::ReadFile), suffix.as_ref())
                    .file_name(name.as_str())
                    .range(*offset, *length);
                if *force {
                    req = req.force();
                }
                (req, output.clone())
            }
            RawCommands::Stat { name, suffix, force } => {
                let mut req = with_suffix(ActionRequest::raw(ActionKind::StatFile), suffix.as_ref())
                    .file_name(name.as_str());
                if *force {
                    req = req.force();
                }
                (req, None)
            }
            RawCommands::Rm { name, suffix, mode } => {
                let req = with_suffix(ActionRequest::raw(ActionKind::RemoveFile), suffix.as_ref())
                    .file_name(name.as_str())
                    .unlink((*mode).into());
                (req, None)
            }
        },
        Commands::Fs { user, action } => {
            let user = *user;
            match action {
                FsCommands::Mkdir { path, parents } | FsCommands::Touch { path, parents } => {
                    let kind = if matches!(action, FsCommands::Mkdir { .. }) {
                        ActionKind::CreateDir
                    } else {
                        ActionKind::CreateFile
                    };
                    let req = ActionRequest::custom(kind, user, path.as_str());
                    (if *parents { req.recursive() } else { req }, None)
                }
                FsCommands::Rmdir { path } => {
                    (ActionRequest::custom(ActionKind::RemoveDir, user, path.as_str()), None)
                }
                FsCommands::Mv { from, to, dir } => {
                    let kind = if *dir { ActionKind::MoveDir } else { ActionKind::MoveFile };
                    (ActionRequest::custom(kind, user, from.as_str()).new_path(to.as_str()), None)
                }
                FsCommands::Ls { path } => {
                    (ActionRequest::custom(ActionKind::ListDir, user, path.as_str()), None)
                }
                FsCommands::Stat { path } => {
                    (ActionRequest::custom(ActionKind::ListFile, user, path.as_str()), None)
                }
                FsCommands::Write { path, file, offset } => {
                    let req = ActionRequest::custom(ActionKind::WriteFile, user, path.as_str())
                        .range(*offset, None)
                        .body(read_body(file)?);
                    (req, None)
                }
                FsCommands::Read { path, offset, length, output } => {
                    let req = ActionRequest::custom(ActionKind::ReadFile, user, path.as_str())
                        .range(*offset, *length);
                    (req, output.clone())
                }
                FsCommands::Rm { path } => {
                    (ActionRequest::custom(ActionKind::RemoveFile, user, path.as_str()), None)
                }
            }
        }
    };
    Ok(built)
}

fn print_outcome(outcome: &ActionOutcome, output: Option<&Path>) -> Result<()> {
    if !outcome.holes.is_empty() {
        warn!("{} unwritten ranges were zero filled", outcome.holes.len());
    }
    if let Some(path) = output {
        std::fs::write(path, &outcome.body).with_context(|| format!("failed to write {}", path.display()))?;
        println!("{} bytes written to {}", outcome.byte_count(), path.display());
        return Ok(());
    }
    if outcome.content_type == tfsproxy_client::action::CONTENT_JSON {
        let value: serde_json::Value = serde_json::from_slice(&outcome.body)?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else if outcome.body.is_empty() {
        println!("{}", outcome.status);
    } else {
        std::io::stdout().write_all(&outcome.body)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config);

    debug!("config: {:?}", config);
    let (request, output) = build_request(&args.command)?;
    let kind = request.kind;

    let transport = Arc::new(TcpTransport::new(config.timeouts.clone()));
    let engine = Engine::new(config, transport);

    let outcome = match args.deadline_ms {
        Some(ms) => engine.execute_with_deadline(request, Duration::from_millis(ms)).await,
        None => engine.execute(request).await,
    };
    info!("{} finished with {} after {:?}", kind, outcome.status, outcome.history);

    if let Err(e) = engine.routing().logout().await {
        warn!("logout failed: {}", e);
    }

    if !outcome.is_success() {
        bail!(
            "{} failed with status {}: {}",
            kind,
            outcome.status,
            outcome.error.as_deref().unwrap_or("no detail")
        );
    }
    print_outcome(&outcome, output.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_config_file_and_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[upstream]
rc_servers = ["10.0.0.1:6100"]
app_key = "from-file"

[batch]
max_batch_count = 4

[logging]
level = "debug"
"#
        )
        .unwrap();
        let path = file.path().to_str().unwrap();

        let args = parse(&["tfsproxy-cli", "-c", path, "app-id"]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.upstream.app_key, "from-file");
        assert_eq!(config.batch.max_batch_count, 4);
        assert_eq!(config.logging.level, "debug");

        let args = parse(&[
            "tfsproxy-cli",
            "-c",
            path,
            "--app-key",
            "from-flag",
            "--rc-server",
            "10.0.0.2:6100,10.0.0.3:6100",
            "--log-format",
            "json",
            "keepalive",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.upstream.app_key, "from-flag");
        assert_eq!(config.upstream.rc_servers.len(), 2);
        assert_eq!(config.upstream.rc_servers[0].to_string(), "10.0.0.2:6100");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_missing_file_needs_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.toml");
        let missing = missing.to_str().unwrap();

        let args = parse(&["tfsproxy-cli", "-c", missing, "app-id"]);
        assert!(load_config(&args).is_err());

        let args = parse(&["tfsproxy-cli", "-c", missing, "--name-server", "10.0.1.1:8100", "app-id"]);
        let config = load_config(&args).unwrap();
        assert!(config.upstream.rc_servers.is_empty());
        assert!(config.upstream.name_server.is_some());
    }

    #[test]
    fn test_bad_config_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[upstream\nrc_servers = 1").unwrap();
        let args = parse(&["tfsproxy-cli", "-c", file.path().to_str().unwrap(), "app-id"]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_bad_address_is_rejected() {
        assert!(Args::try_parse_from(["tfsproxy-cli", "--rc-server", "nowhere", "app-id"]).is_err());
    }

    #[test]
    fn test_raw_requests() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        let body = file.path().to_str().unwrap();

        let args = parse(&["tfsproxy-cli", "raw", "put", body, "--suffix", ".txt", "--large"]);
        let (req, output) = build_request(&args.command).unwrap();
        assert_eq!(req.kind, ActionKind::WriteFile);
        assert_eq!(&req.body[..], b"hello");
        assert_eq!(req.suffix.as_deref(), Some(".txt"));
        assert!(req.large_file);
        assert!(output.is_none());

        let args = parse(&["tfsproxy-cli", "raw", "get", "T1abc", "--offset", "5", "--length", "10", "-o", "/tmp/x"]);
        let (req, output) = build_request(&args.command).unwrap();
        assert_eq!(req.kind, ActionKind::ReadFile);
        assert_eq!((req.offset, req.length), (5, Some(10)));
        assert_eq!(output, Some(PathBuf::from("/tmp/x")));

        let args = parse(&["tfsproxy-cli", "raw", "rm", "T1abc", "--mode", "conceal"]);
        let (req, _) = build_request(&args.command).unwrap();
        assert_eq!(req.unlink_type, UnlinkType::Conceal);
    }

    #[test]
    fn test_named_requests() {
        let args = parse(&["tfsproxy-cli", "fs", "-u", "7", "mkdir", "-p", "/a/b"]);
        let (req, _) = build_request(&args.command).unwrap();
        assert_eq!(req.kind, ActionKind::CreateDir);
        assert_eq!(req.user_id, 7);
        assert!(req.recursive);

        let args = parse(&["tfsproxy-cli", "fs", "touch", "/a/f"]);
        let (req, _) = build_request(&args.command).unwrap();
        assert_eq!(req.kind, ActionKind::CreateFile);
        assert!(!req.recursive);

        let args = parse(&["tfsproxy-cli", "fs", "mv", "-d", "/a", "/b"]);
        let (req, _) = build_request(&args.command).unwrap();
        assert_eq!(req.kind, ActionKind::MoveDir);
        assert_eq!(req.path.as_deref(), Some("/a"));
        assert_eq!(req.new_path.as_deref(), Some("/b"));

        let args = parse(&["tfsproxy-cli", "fs", "stat", "/a/f"]);
        let (req, _) = build_request(&args.command).unwrap();
        assert_eq!(req.kind, ActionKind::ListFile);
    }

    #[test]
    fn test_missing_body_file() {
        let args = parse(&["tfsproxy-cli", "raw", "put", "/definitely/not/here"]);
        assert!(build_request(&args.command).is_err());
    }
}
