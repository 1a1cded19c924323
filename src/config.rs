use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::{accounts::DriverSettings, domain::AccountDefaults, fetcher::ConsulSettings, paths::Paths};

pub const DEFAULT_CONSUL_HTTP_ADDR: &str = "http://127.0.0.1:8500";
pub const DEFAULT_USER_KEY_PREFIX: &str = "org/default/users";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "kvusers",
    about = "Reconcile local accounts against user records in Consul KV",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Read a watch notification batch from stdin and reconcile (default).
    Apply,

    /// Print the persisted watermark as JSON.
    ShowState,
}

/// Flags left unset here fall back to the config file, then to defaults.
#[derive(clap::Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        short = 'c',
        global = true,
        env = "KVUSERS_CONFIG_FILE",
        value_name = "PATH"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long = "consul-http-addr",
        global = true,
        env = "CONSUL_HTTP_ADDR",
        value_name = "URL"
    )]
    pub consul_http_addr: Option<String>,

    #[arg(
        long = "consul-token",
        global = true,
        env = "CONSUL_HTTP_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true
    )]
    pub consul_token: Option<String>,

    #[arg(
        long = "user-key-prefix",
        global = true,
        env = "KVUSERS_USER_KEY_PREFIX",
        value_name = "PREFIX"
    )]
    pub user_key_prefix: Option<String>,

    #[arg(
        long = "state-file",
        global = true,
        env = "KVUSERS_STATE_FILE",
        value_name = "PATH"
    )]
    pub state_file: Option<PathBuf>,

    #[arg(
        long = "log-level",
        global = true,
        env = "KVUSERS_LOG_LEVEL",
        value_name = "LEVEL"
    )]
    pub log_level: Option<String>,

    /// Raise verbosity (-v debug, -vv trace).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[arg(
        long = "log-file",
        global = true,
        env = "KVUSERS_LOG_FILE",
        value_name = "PATH"
    )]
    pub log_file: Option<PathBuf>,

    #[arg(
        long = "dry-run",
        global = true,
        env = "KVUSERS_DRY_RUN",
        value_name = "BOOL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub dry_run: Option<bool>,

    #[arg(long = "default-shell", global = true, value_name = "PATH")]
    pub default_shell: Option<String>,

    #[arg(long = "home-base", global = true, value_name = "PATH")]
    pub home_base: Option<PathBuf>,

    #[arg(long = "nologin-shell", global = true, value_name = "PATH")]
    pub nologin_shell: Option<String>,

    #[arg(
        long = "command-timeout-secs",
        global = true,
        value_name = "SECS",
        value_parser = clap::value_parser!(u64).range(1..=600)
    )]
    pub command_timeout_secs: Option<u64>,

    #[arg(
        long = "http-timeout-secs",
        global = true,
        value_name = "SECS",
        value_parser = clap::value_parser!(u64).range(1..=300)
    )]
    pub http_timeout_secs: Option<u64>,

    #[arg(long, global = true, hide = true, default_value = "/")]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub consul_http_addr: Option<String>,
    pub consul_token: Option<String>,
    pub user_key_prefix: Option<String>,
    pub state_file: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub dry_run: Option<bool>,
    pub default_shell: Option<String>,
    pub home_base: Option<PathBuf>,
    pub nologin_shell: Option<String>,
    pub command_timeout_secs: Option<u64>,
    pub http_timeout_secs: Option<u64>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    OutOfRange {
        key: &'static str,
        value: u64,
        range: &'static str,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read { path, source } => write!(f, "read config {}: {source}", path.display()),
            Self::Parse { path, source } => write!(f, "parse config {}: {source}", path.display()),
            Self::OutOfRange { key, value, range } => {
                write!(f, "{key} = {value} is outside {range}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::OutOfRange { .. } => None,
        }
    }
}

/// Fully resolved settings for one invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub consul: ConsulSettings,
    pub state_file: Option<PathBuf>,
    pub log_level: String,
    pub verbose: u8,
    pub log_file: Option<PathBuf>,
    pub dry_run: bool,
    pub defaults: AccountDefaults,
    pub command_timeout: Duration,
    pub paths: Paths,
}

impl Settings {
    pub fn resolve(config: &Config) -> Result<Self, ConfigError> {
        let file = match &config.config {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::default(),
        };
        Self::merge(config, file)
    }

    pub fn merge(config: &Config, file: ConfigFile) -> Result<Self, ConfigError> {
        let command_timeout_secs = in_range(
            "command_timeout_secs",
            config.command_timeout_secs.or(file.command_timeout_secs),
            DEFAULT_COMMAND_TIMEOUT_SECS,
            1..=600,
            "1..=600",
        )?;
        let http_timeout_secs = in_range(
            "http_timeout_secs",
            config.http_timeout_secs.or(file.http_timeout_secs),
            DEFAULT_HTTP_TIMEOUT_SECS,
            1..=300,
            "1..=300",
        )?;

        let builtin = AccountDefaults::default();
        let paths = Paths::new(config.root.clone());
        let state_file = config
            .state_file
            .clone()
            .or(file.state_file)
            .map(|p| if p.is_absolute() { paths.map_abs(&p) } else { p });

        Ok(Self {
            consul: ConsulSettings {
                http_addr: config
                    .consul_http_addr
                    .clone()
                    .or(file.consul_http_addr)
                    .unwrap_or_else(|| DEFAULT_CONSUL_HTTP_ADDR.to_string()),
                token: config.consul_token.clone().or(file.consul_token),
                user_key_prefix: config
                    .user_key_prefix
                    .clone()
                    .or(file.user_key_prefix)
                    .unwrap_or_else(|| DEFAULT_USER_KEY_PREFIX.to_string()),
                timeout: Duration::from_secs(http_timeout_secs),
            },
            state_file,
            log_level: config
                .log_level
                .clone()
                .or(file.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            verbose: config.verbose,
            log_file: config.log_file.clone().or(file.log_file),
            dry_run: config.dry_run.or(file.dry_run).unwrap_or(false),
            defaults: AccountDefaults {
                shell: config
                    .default_shell
                    .clone()
                    .or(file.default_shell)
                    .unwrap_or(builtin.shell),
                home_base: config
                    .home_base
                    .clone()
                    .or(file.home_base)
                    .unwrap_or(builtin.home_base),
                nologin_shell: config
                    .nologin_shell
                    .clone()
                    .or(file.nologin_shell)
                    .unwrap_or(builtin.nologin_shell),
            },
            command_timeout: Duration::from_secs(command_timeout_secs),
            paths,
        })
    }

    /// `-v`/`-vv` win over the configured level.
    pub fn effective_log_level(&self) -> &str {
        match self.verbose {
            0 => &self.log_level,
            1 => "debug",
            _ => "trace",
        }
    }

    pub fn driver_settings(&self) -> DriverSettings {
        DriverSettings {
            paths: self.paths.clone(),
            defaults: self.defaults.clone(),
            command_timeout: self.command_timeout,
        }
    }
}

fn in_range(
    key: &'static str,
    value: Option<u64>,
    default: u64,
    range: std::ops::RangeInclusive<u64>,
    label: &'static str,
) -> Result<u64, ConfigError> {
    let value = value.unwrap_or(default);
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange {
            key,
            value,
            range: label,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["kvusers"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_apply_when_flags_absent() {
        let cli = parse(&[]);
        assert_eq!(cli.command, None);
        let settings = Settings::merge(&cli.config, ConfigFile::default()).unwrap();
        assert_eq!(settings.consul.user_key_prefix, DEFAULT_USER_KEY_PREFIX);
        assert_eq!(settings.command_timeout, Duration::from_secs(30));
        assert_eq!(settings.consul.timeout, Duration::from_secs(10));
        assert_eq!(settings.defaults, AccountDefaults::default());
        assert!(!settings.paths.is_alternate_root());
    }

    #[test]
    fn subcommands_parse() {
        assert_eq!(parse(&["apply"]).command, Some(Command::Apply));
        assert_eq!(parse(&["show-state"]).command, Some(Command::ShowState));
    }

    #[test]
    fn rejects_invalid_command_timeout_secs() {
        let err = Cli::try_parse_from(["kvusers", "--command-timeout-secs", "0"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--command-timeout-secs"));
        assert!(msg.contains("1..=600"));
    }

    #[test]
    fn rejects_invalid_http_timeout_secs() {
        let err = Cli::try_parse_from(["kvusers", "--http-timeout-secs", "301"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--http-timeout-secs"));
        assert!(msg.contains("1..=300"));
    }

    #[test]
    fn dry_run_accepts_bare_flag_and_bool_value() {
        assert_eq!(parse(&["--dry-run"]).config.dry_run, Some(true));
        assert_eq!(parse(&["--dry-run=false"]).config.dry_run, Some(false));
        assert_eq!(parse(&["--dry-run", "apply"]).command, Some(Command::Apply));
    }

    #[test]
    fn verbosity_overrides_log_level() {
        let cli = parse(&["-vv", "--log-level", "warn"]);
        let settings = Settings::merge(&cli.config, ConfigFile::default()).unwrap();
        assert_eq!(settings.log_level, "warn");
        assert_eq!(settings.effective_log_level(), "trace");
    }

    #[test]
    fn command_line_wins_over_file() {
        let file: ConfigFile = serde_yaml::from_str(
            "consul_http_addr: http://consul.internal:8500\n\
             user_key_prefix: org/acme/users\n\
             default_shell: /bin/zsh\n\
             dry_run: true\n\
             http_timeout_secs: 20\n",
        )
        .unwrap();
        let cli = parse(&["--user-key-prefix", "org/other/users", "--dry-run=no"]);
        let settings = Settings::merge(&cli.config, file).unwrap();

        assert_eq!(settings.consul.http_addr, "http://consul.internal:8500");
        assert_eq!(settings.consul.user_key_prefix, "org/other/users");
        assert_eq!(settings.defaults.shell, "/bin/zsh");
        assert!(!settings.dry_run);
        assert_eq!(settings.consul.timeout, Duration::from_secs(20));
    }

    #[test]
    fn file_values_are_range_checked() {
        let file = ConfigFile {
            command_timeout_secs: Some(0),
            ..Default::default()
        };
        let err = Settings::merge(&parse(&[]).config, file).unwrap_err();
        assert!(err.to_string().contains("command_timeout_secs"));
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("kvusers.yaml");
        fs::write(&path, "consul_addr: nope\n").unwrap();
        assert!(matches!(
            ConfigFile::load(&path),
            Err(ConfigError::Parse { .. })
        ));

        fs::write(&path, "\n").unwrap();
        assert_eq!(ConfigFile::load(&path).unwrap(), ConfigFile::default());
    }

    #[test]
    fn state_file_follows_alternate_root() {
        let cli = parse(&["--root", "/tmp/stage", "--state-file", "/var/lib/kvusers/state"]);
        let settings = Settings::merge(&cli.config, ConfigFile::default()).unwrap();
        assert_eq!(
            settings.state_file,
            Some(PathBuf::from("/tmp/stage/var/lib/kvusers/state"))
        );
    }
}
