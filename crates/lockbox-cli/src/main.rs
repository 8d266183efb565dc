//! lockbox: encrypt files with a passphrase-gated key from the platform keychain
//!
//! Commands:
//!   encrypt <file>                 - encrypt into the output directory and catalog it
//!   decrypt <id> [--out <path>]    - decrypt a catalogued artifact
//!   list                           - show catalogued files
//!   delete <id>                    - remove an artifact and its catalog entry
//!   credential set                 - enroll or replace the user passphrase
//!   key status|init|recreate       - inspect and manage the encryption key
//!   config show                    - display current configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use lockbox_core::config::{default_config_path, expand_tilde, KeystoreBackend, LockboxConfig};
use lockbox_core::{FileDescriptor, LockboxError, OperationState};
use lockbox_engine::{
    is_same_file, Catalog, CryptoEvent, CryptoOrchestrator, JsonCatalog, OperationHandle,
    OrchestratorOptions,
};
use lockbox_secrets::auth::PASSPHRASE_ENV;
use lockbox_secrets::{
    AuthGate, Authenticator, EnvAuthenticator, KdfParams, KeyHealth, KeyManager,
    KeychainKeyStore, MemoryKeyStore, SecureKeyStore, TerminalAuthenticator,
};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "lockbox",
    version,
    about = "Encrypt files behind your passphrase",
    long_about = "lockbox: encrypt and decrypt files with an AES-256 key held in the platform \
                  keychain; every use of the key requires your passphrase"
)]
struct Cli {
    /// Path to the configuration file (default: ~/.config/lockbox/config.toml)
    #[arg(long, short = 'c', env = "LOCKBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (overrides config; RUST_LOG overrides both)
    #[arg(long, env = "LOCKBOX_LOG")]
    log: Option<String>,

    /// Log format (overrides config)
    #[arg(long, env = "LOCKBOX_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Encrypt a file into the output directory
    ///
    /// The passphrase is read from LOCKBOX_PASSPHRASE when set, otherwise
    /// prompted for on the terminal.
    Encrypt {
        /// Plaintext file to encrypt
        file: PathBuf,
    },

    /// Decrypt a catalogued artifact
    Decrypt {
        /// Catalog id (see `lockbox list`)
        id: i64,
        /// Where to write the plaintext (default: ./<original name>)
        #[arg(long, short = 'o')]
        out: Option<PathBuf>,
        /// Overwrite the output file if it exists
        #[arg(long)]
        force: bool,
    },

    /// List catalogued files
    List,

    /// Delete an artifact from disk and remove its catalog entry
    Delete {
        id: i64,
    },

    /// User credential management
    Credential {
        #[command(subcommand)]
        action: CredentialAction,
    },

    /// Encryption key management
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum CredentialAction {
    /// Enroll (or replace) the passphrase that unlocks the key
    Set {
        /// Confirm replacing an existing credential, which invalidates the key
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /// Show whether the key exists and is usable
    Status,
    /// Create the key if it does not exist yet
    Init,
    /// Destroy and regenerate the key
    ///
    /// Every file encrypted with the old key becomes permanently undecryptable.
    Recreate {
        /// Confirm destroying the current key
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Display the effective configuration
    Show,
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// How long exit waits for blocking threads, such as a dismissed passphrase
/// prompt still parked in a terminal read
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_to_completion(run(cli))?
}

/// Drive `future` on a fresh runtime, then shut it down without waiting on
/// blocking work that can no longer affect the result.
fn run_to_completion<F: std::future::Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting tokio runtime")?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    Ok(output)
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let loaded = load_config(&config_path).await?;
    let config = loaded.config;

    let level = cli.log.as_deref().unwrap_or(&config.logging.log_level);
    let format = cli
        .log_format
        .unwrap_or_else(|| parse_log_format(&config.logging.log_format));
    init_logging(level, format);

    if !loaded.found {
        debug!("config file not found: {}  (using defaults)", config_path.display());
    } else if config.config_file_mode_check {
        check_config_mode(&config_path);
    }

    let app = || App::open(&config);
    match cli.command {
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path, loaded.found),
        Commands::Encrypt { file } => app()?.cmd_encrypt(&file).await,
        Commands::Decrypt { id, out, force } => app()?.cmd_decrypt(id, out.as_deref(), force).await,
        Commands::List => app()?.cmd_list(),
        Commands::Delete { id } => app()?.cmd_delete(id),
        Commands::Credential {
            action: CredentialAction::Set { yes },
        } => app()?.cmd_credential_set(yes),
        Commands::Key { action } => {
            let app = app()?;
            match action {
                KeyAction::Status => app.cmd_key_status(),
                KeyAction::Init => app.cmd_key_init(),
                KeyAction::Recreate { yes } => app.cmd_key_recreate(yes),
            }
        }
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

struct LoadedConfig {
    config: LockboxConfig,
    found: bool,
}

async fn load_config(path: &Path) -> Result<LoadedConfig> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        Ok(LoadedConfig {
            config,
            found: true,
        })
    } else {
        Ok(LoadedConfig {
            config: LockboxConfig::default(),
            found: false,
        })
    }
}

fn parse_log_format(s: &str) -> LogFormat {
    if s.eq_ignore_ascii_case("json") {
        LogFormat::Json
    } else {
        LogFormat::Text
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

#[cfg(unix)]
fn check_config_mode(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(meta) = std::fs::metadata(path) {
        if meta.permissions().mode() & 0o004 != 0 {
            warn!(
                path = %path.display(),
                "config file is world-readable; consider chmod 600"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_config_mode(_path: &Path) {}

// ── Wiring ────────────────────────────────────────────────────────────────────

struct App {
    config: LockboxConfig,
    keys: Arc<KeyManager>,
    catalog: Arc<JsonCatalog>,
}

impl App {
    fn open(config: &LockboxConfig) -> Result<Self> {
        let store = open_key_store(config)?;
        let keys = Arc::new(KeyManager::new(store));
        let catalog = Arc::new(JsonCatalog::new(expand_tilde(&config.storage.catalog_path)));
        Ok(Self {
            config: config.clone(),
            keys,
            catalog,
        })
    }

    fn orchestrator(&self) -> CryptoOrchestrator {
        let env = EnvAuthenticator::default();
        let authenticator: Arc<dyn Authenticator> = if env.is_set() {
            debug!("reading passphrase from environment");
            Arc::new(env)
        } else {
            Arc::new(TerminalAuthenticator)
        };
        let gate = Arc::new(AuthGate::new(authenticator, self.config.auth.max_attempts));
        CryptoOrchestrator::new(
            Arc::clone(&self.keys),
            gate,
            self.catalog.clone(),
            OrchestratorOptions::from_config(&self.config),
        )
    }

    // ── `lockbox encrypt` ─────────────────────────────────────────────────────

    async fn cmd_encrypt(&self, file: &Path) -> Result<()> {
        let source = FileDescriptor::from_path(file)
            .with_context(|| format!("reading {}", file.display()))?;
        let total = source.size;
        let name = source.display_name.clone();

        let handle = self.orchestrator().encrypt(source);
        let result = drive(handle, "encrypt", total).await.map_err(explain)?;

        println!(
            "Encrypted {name} ({}) -> {}",
            fmt_bytes(result.size),
            result.location.display()
        );
        if let Some(id) = result.id {
            println!("  catalog id: {id}");
        }
        Ok(())
    }

    // ── `lockbox decrypt` ─────────────────────────────────────────────────────

    async fn cmd_decrypt(&self, id: i64, out: Option<&Path>, force: bool) -> Result<()> {
        let entry = self
            .catalog
            .get(id)
            .with_context(|| format!("looking up catalog entry {id}"))?;
        if !entry.is_encrypted {
            anyhow::bail!("catalog entry {id} is not an encrypted file");
        }

        let target = decrypt_target(&entry, out)?;
        if target.exists() && !force {
            anyhow::bail!(
                "{} already exists (use --force to overwrite)",
                target.display()
            );
        }

        let total = entry.size;
        let name = entry.display_name.clone();
        let handle = self.orchestrator().decrypt(entry, target, name);
        let result = drive(handle, "decrypt", total).await.map_err(explain)?;

        println!(
            "Decrypted {} ({}) -> {}",
            result.display_name,
            fmt_bytes(result.size),
            result.location.display()
        );
        Ok(())
    }

    // ── `lockbox list` ────────────────────────────────────────────────────────

    fn cmd_list(&self) -> Result<()> {
        let entries = self.catalog.list_entries().context("reading catalog")?;
        if entries.is_empty() {
            println!("No files yet. Encrypt one with `lockbox encrypt <file>`.");
            return Ok(());
        }

        println!("{:>5}  {:<9}  {:>10}  {:<24}  NAME", "ID", "KIND", "SIZE", "TYPE");
        for entry in &entries {
            let id = entry.id.map(|i| i.to_string()).unwrap_or_else(|| "-".into());
            let kind = if entry.is_encrypted { "encrypted" } else { "plain" };
            let missing = if entry.location.exists() { "" } else { "  (missing)" };
            println!(
                "{:>5}  {:<9}  {:>10}  {:<24}  {}{}",
                id,
                kind,
                fmt_bytes(entry.size),
                entry.mime_type,
                entry.display_name,
                missing
            );
        }
        Ok(())
    }

    // ── `lockbox delete` ──────────────────────────────────────────────────────

    fn cmd_delete(&self, id: i64) -> Result<()> {
        let entry = self
            .catalog
            .get(id)
            .with_context(|| format!("looking up catalog entry {id}"))?;

        match std::fs::remove_file(&entry.location) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %entry.location.display(), "file already gone");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("deleting {}", entry.location.display()))
            }
        }
        self.catalog
            .delete_entry(id)
            .with_context(|| format!("removing catalog entry {id}"))?;

        println!("Deleted #{id} {}", entry.display_name);
        Ok(())
    }

    // ── `lockbox credential set` ──────────────────────────────────────────────

    fn cmd_credential_set(&self, yes: bool) -> Result<()> {
        let status = self.keys.key_status()?;
        if matches!(status, KeyHealth::Ready) && !yes {
            anyhow::bail!(
                "a key protected by the current credential exists; replacing the credential \
                 invalidates it and every file encrypted with it. Re-run with --yes to proceed"
            );
        }

        let passphrase = read_new_passphrase()?;
        self.keys
            .enroll_credential(&passphrase, &KdfParams::from(&self.config.auth))?;
        println!("Credential enrolled.");
        if matches!(status, KeyHealth::Ready | KeyHealth::Invalidated) {
            println!("The existing key is now invalid; run `lockbox key recreate --yes`.");
        }
        Ok(())
    }

    // ── `lockbox key` ─────────────────────────────────────────────────────────

    fn cmd_key_status(&self) -> Result<()> {
        let backend = match self.config.keystore.backend {
            KeystoreBackend::Keychain => "keychain",
            KeystoreBackend::Memory => "memory",
        };
        println!("key alias: {}", self.keys.alias());
        println!("backend:   {backend} (service {})", self.config.keystore.service);
        println!("status:    {}", self.keys.key_status()?);
        Ok(())
    }

    fn cmd_key_init(&self) -> Result<()> {
        match self.keys.ensure_key()? {
            lockbox_secrets::KeyStatus::Created => println!("Key '{}' created.", self.keys.alias()),
            lockbox_secrets::KeyStatus::Exists => {
                println!("Key '{}' already exists.", self.keys.alias())
            }
        }
        Ok(())
    }

    fn cmd_key_recreate(&self, yes: bool) -> Result<()> {
        if !yes {
            anyhow::bail!(
                "recreating the key makes every file encrypted so far permanently \
                 undecryptable. Re-run with --yes to proceed"
            );
        }
        self.keys.recreate_key()?;
        println!("Key '{}' recreated.", self.keys.alias());
        Ok(())
    }
}

fn cmd_config_show(config: &LockboxConfig, config_path: &Path, found: bool) -> Result<()> {
    if found {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!(
            "# Configuration: defaults (no file at {})",
            config_path.display()
        );
    }
    println!();
    let rendered = toml::to_string_pretty(config).context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

fn open_key_store(config: &LockboxConfig) -> Result<Arc<dyn SecureKeyStore>> {
    let ks = &config.keystore;
    match ks.backend {
        KeystoreBackend::Keychain => {
            let store = KeychainKeyStore::new(&ks.service, &ks.key_alias);
            store.check_available().context(
                "platform keychain unavailable; set keystore.backend = \"memory\" for a \
                 throwaway session",
            )?;
            Ok(Arc::new(store))
        }
        KeystoreBackend::Memory => {
            warn!("using the in-memory key store; the key is lost when lockbox exits");
            let passphrase = session_passphrase()?;
            Ok(Arc::new(memory_session(config, &passphrase)?))
        }
    }
}

/// In-memory store with `passphrase` already enrolled, so the process can
/// create a key and pass the gate without a separate `credential set`.
fn memory_session(config: &LockboxConfig, passphrase: &SecretString) -> Result<MemoryKeyStore> {
    let store = MemoryKeyStore::new(&config.keystore.key_alias);
    store
        .enroll_credential(passphrase, &KdfParams::from(&config.auth))
        .context("enrolling session credential")?;
    debug!("session credential enrolled in memory");
    Ok(store)
}

/// `LOCKBOX_PASSPHRASE` when set, otherwise a fresh prompt.
fn session_passphrase() -> Result<SecretString> {
    match std::env::var(PASSPHRASE_ENV) {
        Ok(value) if !value.is_empty() => Ok(SecretString::from(value)),
        _ => {
            eprintln!("In-memory key store: choose a passphrase for this session.");
            read_new_passphrase()
        }
    }
}

fn read_new_passphrase() -> Result<SecretString> {
    let first = SecretString::from(
        rpassword::prompt_password("New passphrase: ").context("reading passphrase")?,
    );
    if first.expose_secret().is_empty() {
        anyhow::bail!("passphrase must not be empty");
    }
    let second = SecretString::from(
        rpassword::prompt_password("Repeat passphrase: ").context("reading passphrase")?,
    );
    if first.expose_secret() != second.expose_secret() {
        anyhow::bail!("passphrases do not match");
    }
    Ok(first)
}

/// `--out` if given, otherwise the original name in the current directory.
/// Never the artifact itself.
fn decrypt_target(entry: &FileDescriptor, out: Option<&Path>) -> Result<PathBuf> {
    let target = match out {
        Some(out) => out.to_path_buf(),
        None => {
            let name = Path::new(&entry.display_name)
                .file_name()
                .context("catalog entry has no usable file name; pass --out")?;
            let cwd = std::env::current_dir().context("resolving current directory")?;
            cwd.join(name)
        }
    };
    if is_same_file(&target, &entry.location) {
        anyhow::bail!(
            "{} is the encrypted file itself; choose another --out",
            target.display()
        );
    }
    Ok(target)
}

/// Add a remedy to errors the user can act on.
fn explain(err: LockboxError) -> anyhow::Error {
    use lockbox_core::ErrorKind;

    let hint = match err.kind() {
        ErrorKind::KeyInvalidated => Some(
            "the credential changed since the key was created; run `lockbox key recreate --yes` \
             (files encrypted with the old key cannot be recovered)",
        ),
        ErrorKind::Key => Some("run `lockbox credential set` and `lockbox key init` first"),
        ErrorKind::Codec => Some("the file is not a lockbox container or is damaged"),
        _ => None,
    };
    match hint {
        Some(hint) => anyhow::Error::new(err).context(hint),
        None => anyhow::Error::new(err),
    }
}

// ── Progress rendering ────────────────────────────────────────────────────────

/// Render an operation's events until it finishes. Ctrl-C cancels it while it
/// is still waiting for the passphrase.
async fn drive(
    mut handle: OperationHandle,
    label: &str,
    total: u64,
) -> std::result::Result<FileDescriptor, LockboxError> {
    let cancel = handle.cancellation_token();
    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());
    let mut bar: Option<ProgressBar> = None;

    loop {
        let event = tokio::select! {
            event = handle.next_event() => event,
            _ = &mut ctrl_c, if !cancel.is_cancelled() => {
                cancel.cancel();
                continue;
            }
        };
        let Some(event) = event else { break };

        match event {
            CryptoEvent::State(OperationState::Transferring) if total > 0 => {
                bar = Some(make_progress_bar(total, label));
            }
            CryptoEvent::State(state) => debug!(op = label, %state, "state"),
            CryptoEvent::Indeterminate => {
                bar = Some(make_spinner(label));
            }
            CryptoEvent::Progress { bytes, .. } => {
                if let Some(pb) = &bar {
                    pb.set_position(bytes);
                }
            }
            CryptoEvent::Complete(_) => {
                if let Some(pb) = bar.take() {
                    pb.finish_and_clear();
                }
            }
            CryptoEvent::Failed { .. } => {
                if let Some(pb) = bar.take() {
                    pb.abandon();
                }
            }
        }
    }
    handle.wait().await
}

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn make_spinner(prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
