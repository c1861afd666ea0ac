//! Configuration
//!
//! Static deployment configuration. Loaded once at startup from an optional
//! TOML file, then adjusted by environment overrides. Nothing here can be
//! changed per connection.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BridgeError, BridgeResult};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 30;
pub const DEFAULT_TERM: &str = "xterm-color";

/// Principal assigned to the token supplied through `SHELLGATE_TOKEN`
pub const ENV_TOKEN_PRINCIPAL: &str = "default";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub shell: ShellConfig,
    pub auth: AuthConfig,
    pub limits: LimitsConfig,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Route that upgrades to the terminal WebSocket
    pub ws_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            ws_path: "/ws".to_string(),
        }
    }
}

/// Shell process settings, identical for every session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell program, resolved through `PATH` when not absolute
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    /// Value of `TERM` inside the session
    pub term: String,
    /// Working directory; the user's home directory when unset
    pub cwd: Option<PathBuf>,
    /// Start from the server's own environment
    pub inherit_env: bool,
    /// Extra variables applied on top of the inherited environment
    pub env: HashMap<String, String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: default_shell(),
            args: Vec::new(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            term: DEFAULT_TERM.to_string(),
            cwd: None,
            inherit_env: true,
            env: HashMap::new(),
        }
    }
}

/// One fixed interactive shell per host platform
fn default_shell() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("powershell.exe")
    } else {
        PathBuf::from("bash")
    }
}

impl ShellConfig {
    /// Create a configuration running the given program
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Resolve the shell program to an executable path
    pub fn resolve_program(&self) -> BridgeResult<PathBuf> {
        which::which(&self.program).map_err(|e| {
            BridgeError::Spawn(format!(
                "shell program {} not found: {}",
                self.program.display(),
                e
            ))
        })
    }

    /// Working directory for new sessions
    pub fn working_dir(&self) -> Option<PathBuf> {
        self.cwd.clone().or_else(dirs::home_dir)
    }

    /// Full environment handed to the shell.
    ///
    /// Inherited variables are kept as raw OS strings; they need not be UTF-8.
    pub fn environment(&self) -> HashMap<OsString, OsString> {
        let mut vars: HashMap<OsString, OsString> = if self.inherit_env {
            std::env::vars_os().collect()
        } else {
            HashMap::new()
        };
        vars.extend(
            self.env
                .iter()
                .map(|(k, v)| (OsString::from(k), OsString::from(v))),
        );
        vars.insert(OsString::from("TERM"), OsString::from(&self.term));
        vars
    }
}

/// Credential surfacing on the WebSocket handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Accepted credentials mapped to the principal they authorize
    pub tokens: HashMap<String, String>,
    /// Cookie carrying the credential
    pub cookie_name: String,
    /// Query parameter carrying the credential, if allowed
    pub query_param: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            tokens: HashMap::new(),
            cookie_name: "shellgate_session".to_string(),
            query_param: Some("token".to_string()),
        }
    }
}

/// What the PTY reader does when the outbound queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Stall the reader until the client catches up
    #[default]
    Block,
    /// Discard the chunk and log a warning
    Drop,
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_sessions: usize,
    /// Seconds without traffic before a session is closed, 0 disables
    pub idle_timeout_secs: u64,
    /// Time a process gets to exit after the hang-up signal
    pub kill_grace_ms: u64,
    /// Outbound queue size, in chunks, per session
    pub output_queue_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sessions: 32,
            idle_timeout_secs: 0,
            kill_grace_ms: 2000,
            output_queue_capacity: 64,
            overflow: OverflowPolicy::Block,
        }
    }
}

impl LimitsConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl Config {
    /// Load configuration from an optional file plus the process environment
    pub fn load(path: Option<&Path>) -> BridgeResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML configuration file
    pub fn from_file(path: &Path) -> BridgeResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Apply environment overrides using the given lookup
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) => self.server.bind.set_port(port),
                Err(_) => log::warn!("Ignoring invalid PORT value: {}", port),
            }
        }
        if let Some(token) = lookup("SHELLGATE_TOKEN").filter(|t| !t.is_empty()) {
            self.auth
                .tokens
                .insert(token, ENV_TOKEN_PRINCIPAL.to_string());
        }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.shell.cols == 0 || self.shell.rows == 0 {
            return Err(BridgeError::InvalidConfig(
                "terminal geometry must be non-zero".to_string(),
            ));
        }
        if self.limits.max_sessions == 0 {
            return Err(BridgeError::InvalidConfig(
                "max_sessions must be at least 1".to_string(),
            ));
        }
        if self.limits.output_queue_capacity == 0 {
            return Err(BridgeError::InvalidConfig(
                "output_queue_capacity must be at least 1".to_string(),
            ));
        }
        if !self.server.ws_path.starts_with('/') {
            return Err(BridgeError::InvalidConfig(format!(
                "ws_path must start with '/': {}",
                self.server.ws_path
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.bind.port(), DEFAULT_PORT);
        assert_eq!(config.shell.cols, 80);
        assert_eq!(config.shell.rows, 30);
        assert_eq!(config.shell.term, "xterm-color");
        assert_eq!(config.limits.overflow, OverflowPolicy::Block);
        assert!(config.limits.idle_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [shell]
            program = "/bin/sh"
            rows = 40

            [auth.tokens]
            secret = "alice"

            [limits]
            idle_timeout_secs = 600
            overflow = "drop"
            "#,
        )
        .unwrap();

        assert_eq!(config.shell.program, PathBuf::from("/bin/sh"));
        assert_eq!(config.shell.rows, 40);
        assert_eq!(config.shell.cols, DEFAULT_COLS);
        assert_eq!(config.auth.tokens.get("secret").map(String::as_str), Some("alice"));
        assert_eq!(config.limits.idle_timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.limits.overflow, OverflowPolicy::Drop);
        assert_eq!(config.limits.max_sessions, 32);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nws_path = \"/term\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.server.ws_path, "/term");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            "PORT" => Some("8080".to_string()),
            "SHELLGATE_TOKEN" => Some("tok".to_string()),
            _ => None,
        });

        assert_eq!(config.server.bind.port(), 8080);
        assert_eq!(
            config.auth.tokens.get("tok").map(String::as_str),
            Some(ENV_TOKEN_PRINCIPAL)
        );
    }

    #[test]
    fn test_invalid_port_is_ignored() {
        let mut config = Config::default();
        config.apply_env(|key| (key == "PORT").then(|| "not-a-port".to_string()));
        assert_eq!(config.server.bind.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.shell.cols = 0;
        assert!(matches!(config.validate(), Err(BridgeError::InvalidConfig(_))));

        let mut config = Config::default();
        config.limits.max_sessions = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.server.ws_path = "ws".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_environment_sets_term() {
        let mut shell = ShellConfig::with_program("/bin/sh");
        shell.inherit_env = false;
        shell.env.insert("FOO".to_string(), "bar".to_string());

        let env = shell.environment();
        assert_eq!(env.len(), 2);
        assert_eq!(env.get(&OsString::from("TERM")), Some(&OsString::from(DEFAULT_TERM)));
        assert_eq!(env.get(&OsString::from("FOO")), Some(&OsString::from("bar")));
    }

    #[cfg(unix)]
    #[test]
    fn test_environment_keeps_non_utf8_values() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let key = OsStr::from_bytes(b"SHELLGATE_TEST_RAW_BYTES");
        let value = OsStr::from_bytes(b"\xff\xfe");
        std::env::set_var(key, value);

        let env = ShellConfig::with_program("/bin/sh").environment();
        assert_eq!(env.get(key).map(OsString::as_os_str), Some(value));
        assert_eq!(env.get(OsStr::new("TERM")).map(OsString::as_os_str), Some(OsStr::new(DEFAULT_TERM)));

        std::env::remove_var(key);
    }

    #[test]
    fn test_unknown_program_fails_to_resolve() {
        let shell = ShellConfig::with_program("/definitely/not/a/shell");
        assert!(matches!(shell.resolve_program(), Err(BridgeError::Spawn(_))));
    }
}
