use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from tunnel-relay.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct RelayConfig {
    pub smtp: SmtpConfig,
    pub tunnel: TunnelConfig,
    pub watch: WatchConfig,
    pub provision: ProvisionConfig,
    pub patterns: PatternConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Name of the environment variable holding the SMTP password.
    pub password_env: String,
    pub use_ssl: bool,
    pub starttls: bool,
    pub from_addr: String,
    pub to_addrs: Vec<String>,
    pub subject_prefix: String,
    /// Print notifications to stdout instead of sending mail.
    pub print_only: bool,
    /// Send a "relay started" notice before spawning the login process.
    pub notify_on_start: bool,
    /// Mail the tail of the login output when no device code was recognised.
    pub send_output_on_miss: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub name: String,
    pub provider: Provider,
    pub working_dir: PathBuf,
    /// Login argument template; `{provider}` and `{tunnel_name}` are substituted.
    pub args: Vec<String>,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Github,
    Microsoft,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Github => "github",
            Provider::Microsoft => "microsoft",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Give up on the login after this many seconds (None = wait forever).
    pub timeout_secs: Option<u64>,
    pub grace_period_secs: u64,
    pub drain_timeout_ms: u64,
    pub tail_lines: usize,
    /// Transcript file; relative paths resolve against the working directory.
    pub log_file: PathBuf,
    pub log_append: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub download_url: String,
    pub archive_name: String,
    pub executable_name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    pub version: String,
    pub url: Vec<String>,
    pub code: Vec<String>,
    pub require_url: bool,
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file.
    ///
    /// A missing file is not an error: every setting has a default and
    /// the CLI can supply the rest.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Check settings that can only be judged after CLI overrides are merged.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.smtp.print_only {
            if self.smtp.username.is_empty() {
                return Err(ConfigError::Invalid(
                    "smtp username is required (use --username or --print-only)".into(),
                ));
            }
            if self.smtp.to_addrs.is_empty() {
                return Err(ConfigError::Invalid(
                    "at least one recipient is required (--to-addrs)".into(),
                ));
            }
            if self.smtp.host.is_empty() {
                return Err(ConfigError::Invalid("smtp host must not be empty".into()));
            }
            if self.smtp.use_ssl && self.smtp.starttls {
                return Err(ConfigError::Invalid(
                    "--use-ssl and --starttls are mutually exclusive".into(),
                ));
            }
        }
        if self.tunnel.args.is_empty() {
            return Err(ConfigError::Invalid("tunnel.args must not be empty".into()));
        }
        if !self.provision.archive_name.ends_with(".tar.gz") {
            return Err(ConfigError::Invalid(format!(
                "provision.archive_name must end in .tar.gz, got {:?}",
                self.provision.archive_name
            )));
        }
        if self.patterns.code.is_empty() {
            return Err(ConfigError::Invalid(
                "patterns.code must contain at least one pattern".into(),
            ));
        }
        if self.patterns.require_url && self.patterns.url.is_empty() {
            return Err(ConfigError::Invalid(
                "patterns.url is empty but patterns.require_url is set".into(),
            ));
        }
        Ok(())
    }

    /// Transcript path resolved against the working directory.
    pub fn transcript_path(&self, working_dir: &Path) -> PathBuf {
        if self.watch.log_file.is_absolute() {
            self.watch.log_file.clone()
        } else {
            working_dir.join(&self.watch.log_file)
        }
    }
}

// --- Default implementations ---

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "smtp.gmail.com".to_string(),
            port: 587,
            username: String::new(),
            password_env: "SMTP_PASSWORD".to_string(),
            use_ssl: false,
            starttls: false,
            from_addr: String::new(),
            to_addrs: Vec::new(),
            subject_prefix: "[VS Code Tunnel] ".to_string(),
            print_only: false,
            notify_on_start: false,
            send_output_on_miss: false,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            name: "vscode-tunnel".to_string(),
            provider: Provider::Github,
            working_dir: PathBuf::from("."),
            args: vec![
                "tunnel".to_string(),
                "user".to_string(),
                "login".to_string(),
                "--provider".to_string(),
                "{provider}".to_string(),
            ],
            extra_args: Vec::new(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            grace_period_secs: 5,
            drain_timeout_ms: 2000,
            tail_lines: 20,
            log_file: PathBuf::from("tunnel_login_runtime.log"),
            log_append: false,
        }
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            download_url:
                "https://code.visualstudio.com/sha/download?build=stable&os=cli-alpine-x64"
                    .to_string(),
            archive_name: "vscode_cli.tar.gz".to_string(),
            executable_name: "code".to_string(),
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            version: "vscode-cli-1".to_string(),
            url: vec![
                r"log into (?P<url>https?://\S+)".to_string(),
                r"open the page (?P<url>https?://\S+)".to_string(),
                r"(?P<url>https?://github\.com/login/device\S*)".to_string(),
                r"(?P<url>https?://(?:www\.)?microsoft\.com/devicelogin\S*)".to_string(),
            ],
            code: vec![
                r"use code (?P<code>[A-Z0-9]{4,}(?:-[A-Z0-9]{4,})?)".to_string(),
                r"enter the code (?P<code>[A-Z0-9]{4,}(?:-[A-Z0-9]{4,})?)".to_string(),
            ],
            require_url: true,
        }
    }
}
