//! Configuration for the sync loop.
//!
//! Every setting can come from a flag, an environment variable, or an env
//! file, in that order of precedence. The env file is read into a map and
//! the process environment is left untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::Parser;
use tgsync_reconcile::{Port, RetryPolicy, DEFAULT_APPLY_CONCURRENCY, DEFAULT_MAX_ATTEMPTS};
use thiserror::Error;

pub const ENV_TARGET_GROUP_NAME: &str = "AWS_SYNC_TARGET_GROUP_NAME";
pub const ENV_INSTANCE_NAME_PREFIX: &str = "AWS_SYNC_INSTANCE_NAME_PREFIX";
pub const ENV_INSTANCE_PORT: &str = "AWS_SYNC_INSTANCE_PORT";
pub const ENV_SLEEP: &str = "AWS_SYNC_SLEEP";
pub const ENV_DRY_RUN: &str = "AWS_SYNC_DRY_RUN";
pub const ENV_INTERVAL_SECS: &str = "AWS_SYNC_INTERVAL_SECS";
pub const ENV_MAX_ATTEMPTS: &str = "AWS_SYNC_MAX_ATTEMPTS";
pub const ENV_CONCURRENCY: &str = "AWS_SYNC_CONCURRENCY";
pub const ENV_LOG_LEVEL: &str = "AWS_SYNC_LOG_LEVEL";
pub const ENV_REGION: &str = "AWS_DEFAULT_REGION";
pub const ENV_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required value was not provided anywhere.
    #[error("missing required setting --{flag} (or {env})")]
    Missing {
        flag: &'static str,
        env: &'static str,
    },

    /// A value was provided but could not be used.
    #[error("invalid value for {env}: {reason}")]
    Invalid { env: &'static str, reason: String },

    /// The env file could not be read.
    #[error("env file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },
}

/// Keep an ELBv2 target group in sync with running EC2 instances.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "tg-sync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// The target group name to sync the instances with.
    #[arg(long, env = ENV_TARGET_GROUP_NAME)]
    pub target_group_name: Option<String>,

    /// Instances whose Name tag starts with this prefix are assigned to the target group.
    #[arg(long, env = ENV_INSTANCE_NAME_PREFIX)]
    pub instance_name_prefix: Option<String>,

    /// The port on the instances to associate with the target group.
    #[arg(long, env = ENV_INSTANCE_PORT)]
    pub instance_port: Option<String>,

    /// Block until terminated after the sync pass.
    #[arg(long, env = ENV_SLEEP, num_args = 0..=1, default_missing_value = "true",
          value_parser = BoolishValueParser::new())]
    pub sleep: Option<bool>,

    /// Perform checks but do not make any changes.
    #[arg(long, env = ENV_DRY_RUN, num_args = 0..=1, default_missing_value = "true",
          value_parser = BoolishValueParser::new())]
    pub dry_run: Option<bool>,

    /// Repeat the sync pass on this interval until terminated.
    #[arg(long, env = ENV_INTERVAL_SECS)]
    pub interval_secs: Option<String>,

    /// Attempts for the read phase of a pass on transient provider errors.
    #[arg(long, env = ENV_MAX_ATTEMPTS)]
    pub max_attempts: Option<String>,

    /// Concurrent register/deregister calls.
    #[arg(long, env = ENV_CONCURRENCY)]
    pub concurrency: Option<String>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = ENV_LOG_LEVEL)]
    pub log_level: Option<String>,

    /// Env file consulted for settings not given as flags or env vars.
    #[arg(long, env = "AWS_SYNC_ENV_FILE")]
    pub env_file: Option<PathBuf>,

    /// AWS Configuration: Default Region.
    #[arg(long, env = ENV_REGION)]
    pub aws_default_region: Option<String>,

    /// AWS Configuration: IAM Access Key ID.
    #[arg(long, env = ENV_ACCESS_KEY_ID)]
    pub aws_access_key_id: Option<String>,

    /// AWS Configuration: IAM Secret Access Key.
    #[arg(long, env = ENV_SECRET_ACCESS_KEY, hide_env_values = true)]
    pub aws_secret_access_key: Option<String>,

    /// AWS Configuration: Session Token.
    #[arg(long, env = ENV_SESSION_TOKEN, hide_env_values = true)]
    pub aws_session_token: Option<String>,
}

/// What the driver does after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run one pass and exit.
    OneShot,

    /// Run one pass, then block until terminated.
    SleepForever,

    /// Run a pass every `interval` until terminated.
    Continuous { interval: Duration },
}

/// Credentials and region handed to the provider client.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ProviderSettings {
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
}

impl ProviderSettings {
    /// Static credentials, if both halves are present.
    pub fn static_credentials(&self) -> Option<(&str, &str)> {
        match (&self.access_key_id, &self.secret_access_key) {
            (Some(key), Some(secret)) => Some((key.as_str(), secret.as_str())),
            _ => None,
        }
    }
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("region", &self.region)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Resolved sync configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub target_group_name: String,
    pub instance_name_prefix: String,
    pub instance_port: Port,
    pub dry_run: bool,
    pub mode: RunMode,
    pub retry: RetryPolicy,
    pub concurrency: usize,
    pub log_level: String,
    pub provider: ProviderSettings,
}

impl Config {
    /// Parse flags and environment, then fill gaps from the env file.
    ///
    /// An explicitly configured env file must exist; the default `.env` is optional.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = Cli::parse();
        let env_file = match &cli.env_file {
            Some(path) => EnvFile::from_path(path),
            None => EnvFile::from_path_optional(".env"),
        }?;
        Self::resolve(cli, &env_file)
    }

    /// Merge parsed flags (which already include env vars) with an env file.
    pub fn resolve(cli: Cli, env_file: &EnvFile) -> Result<Self, ConfigError> {
        let lookup = |value: Option<String>, env: &'static str| -> Option<String> {
            value
                .or_else(|| env_file.get(env).map(str::to_string))
                .filter(|v| !v.is_empty())
        };

        let target_group_name = lookup(cli.target_group_name, ENV_TARGET_GROUP_NAME).ok_or(
            ConfigError::Missing {
                flag: "target-group-name",
                env: ENV_TARGET_GROUP_NAME,
            },
        )?;

        let instance_name_prefix = lookup(cli.instance_name_prefix, ENV_INSTANCE_NAME_PREFIX)
            .ok_or(ConfigError::Missing {
                flag: "instance-name-prefix",
                env: ENV_INSTANCE_NAME_PREFIX,
            })?;

        let instance_port = lookup(cli.instance_port, ENV_INSTANCE_PORT)
            .ok_or(ConfigError::Missing {
                flag: "instance-port",
                env: ENV_INSTANCE_PORT,
            })?
            .parse::<Port>()
            .map_err(|e| ConfigError::Invalid {
                env: ENV_INSTANCE_PORT,
                reason: e.to_string(),
            })?;

        let sleep = resolve_flag(cli.sleep, env_file, ENV_SLEEP)?;
        let dry_run = resolve_flag(cli.dry_run, env_file, ENV_DRY_RUN)?;

        let interval = lookup(cli.interval_secs, ENV_INTERVAL_SECS)
            .map(|v| parse_positive(&v, ENV_INTERVAL_SECS))
            .transpose()?
            .map(Duration::from_secs);

        let mode = match (interval, sleep) {
            (Some(interval), _) => RunMode::Continuous { interval },
            (None, true) => RunMode::SleepForever,
            (None, false) => RunMode::OneShot,
        };

        let max_attempts = lookup(cli.max_attempts, ENV_MAX_ATTEMPTS)
            .map(|v| parse_positive(&v, ENV_MAX_ATTEMPTS))
            .transpose()?
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);

        let concurrency = lookup(cli.concurrency, ENV_CONCURRENCY)
            .map(|v| parse_positive(&v, ENV_CONCURRENCY))
            .transpose()?
            .map(|v| usize::try_from(v).unwrap_or(usize::MAX))
            .unwrap_or(DEFAULT_APPLY_CONCURRENCY);

        let log_level = lookup(cli.log_level, ENV_LOG_LEVEL).unwrap_or_else(|| "info".to_string());

        let provider = ProviderSettings {
            region: lookup(cli.aws_default_region, ENV_REGION),
            access_key_id: lookup(cli.aws_access_key_id, ENV_ACCESS_KEY_ID),
            secret_access_key: lookup(cli.aws_secret_access_key, ENV_SECRET_ACCESS_KEY),
            session_token: lookup(cli.aws_session_token, ENV_SESSION_TOKEN),
        };

        let config = Self {
            target_group_name,
            instance_name_prefix,
            instance_port,
            dry_run,
            mode,
            retry: RetryPolicy {
                max_attempts,
                ..RetryPolicy::default()
            },
            concurrency,
            log_level,
            provider,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that hold no matter how the config was built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_group_name.trim().is_empty() {
            return Err(ConfigError::Missing {
                flag: "target-group-name",
                env: ENV_TARGET_GROUP_NAME,
            });
        }
        if self.instance_name_prefix.is_empty() {
            return Err(ConfigError::Missing {
                flag: "instance-name-prefix",
                env: ENV_INSTANCE_NAME_PREFIX,
            });
        }
        match (
            &self.provider.access_key_id,
            &self.provider.secret_access_key,
        ) {
            (Some(_), None) => {
                return Err(ConfigError::Invalid {
                    env: ENV_SECRET_ACCESS_KEY,
                    reason: format!("required when {ENV_ACCESS_KEY_ID} is set"),
                })
            }
            (None, Some(_)) => {
                return Err(ConfigError::Invalid {
                    env: ENV_ACCESS_KEY_ID,
                    reason: format!("required when {ENV_SECRET_ACCESS_KEY} is set"),
                })
            }
            _ => {}
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                env: ENV_MAX_ATTEMPTS,
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Key/value pairs read from a dotenv file.
///
/// Values are kept in a map; nothing is exported to the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFile {
    vars: BTreeMap<String, String>,
}

impl EnvFile {
    /// An env file with no entries.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Read `path`, which must exist.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let wrap = |source: dotenvy::Error| ConfigError::EnvFile {
            path: path.to_path_buf(),
            source,
        };
        let iter = dotenvy::from_path_iter(path).map_err(wrap)?;
        iter.collect::<Result<BTreeMap<_, _>, _>>()
            .map(|vars| Self { vars })
            .map_err(wrap)
    }

    /// Read `path` if it exists; a missing file yields an empty map.
    pub fn from_path_optional(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match Self::from_path(path) {
            Err(ConfigError::EnvFile { source, .. }) if source.not_found() => Ok(Self::empty()),
            other => other,
        }
    }

    /// Parse dotenv content from a reader.
    pub fn from_reader(reader: impl Read) -> Result<Self, dotenvy::Error> {
        dotenvy::from_read_iter(reader)
            .collect::<Result<BTreeMap<_, _>, _>>()
            .map(|vars| Self { vars })
    }

    /// Parse dotenv content from a string.
    pub fn parse(content: &str) -> Result<Self, dotenvy::Error> {
        Self::from_reader(content.as_bytes())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

fn resolve_flag(
    value: Option<bool>,
    env_file: &EnvFile,
    env: &'static str,
) -> Result<bool, ConfigError> {
    if let Some(value) = value {
        return Ok(value);
    }
    match env_file.get(env) {
        None => Ok(false),
        Some(raw) => parse_bool(raw).ok_or_else(|| ConfigError::Invalid {
            env,
            reason: format!("expected a boolean, got '{raw}'"),
        }),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" | "n" | "off" | "f" => Some(false),
        "1" | "true" | "yes" | "y" | "on" | "t" => Some(true),
        _ => None,
    }
}

fn parse_positive(raw: &str, env: &'static str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            env,
            reason: "must be greater than zero".to_string(),
        }),
        Ok(v) => Ok(v),
        Err(_) => Err(ConfigError::Invalid {
            env,
            reason: format!("expected a positive integer, got '{raw}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required() -> Cli {
        Cli {
            target_group_name: Some("web-tg".to_string()),
            instance_name_prefix: Some("web-".to_string()),
            instance_port: Some("8080".to_string()),
            ..Cli::default()
        }
    }

    #[test]
    fn test_resolve_defaults() {
        let config = Config::resolve(required(), &EnvFile::empty()).unwrap();

        assert_eq!(config.target_group_name, "web-tg");
        assert_eq!(config.instance_name_prefix, "web-");
        assert_eq!(config.instance_port.get(), 8080);
        assert!(!config.dry_run);
        assert_eq!(config.mode, RunMode::OneShot);
        assert_eq!(config.retry.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(config.concurrency, DEFAULT_APPLY_CONCURRENCY);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.provider, ProviderSettings::default());
    }

    #[test]
    fn test_resolve_missing_required() {
        let cli = Cli {
            target_group_name: None,
            ..required()
        };
        let err = Config::resolve(cli, &EnvFile::empty()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Missing {
                env: ENV_TARGET_GROUP_NAME,
                ..
            }
        ));
    }

    #[test]
    fn test_resolve_rejects_empty_prefix() {
        let cli = Cli {
            instance_name_prefix: Some(String::new()),
            ..required()
        };
        assert!(matches!(
            Config::resolve(cli, &EnvFile::empty()),
            Err(ConfigError::Missing {
                env: ENV_INSTANCE_NAME_PREFIX,
                ..
            })
        ));
    }

    #[test]
    fn test_resolve_invalid_port() {
        let cli = Cli {
            instance_port: Some("70000".to_string()),
            ..required()
        };
        assert!(matches!(
            Config::resolve(cli, &EnvFile::empty()),
            Err(ConfigError::Invalid {
                env: ENV_INSTANCE_PORT,
                ..
            })
        ));
    }

    #[test]
    fn test_env_file_fills_gaps() {
        let env_file = EnvFile::parse(
            "AWS_SYNC_TARGET_GROUP_NAME=from-file\n\
             AWS_SYNC_INSTANCE_NAME_PREFIX=api-\n\
             AWS_SYNC_INSTANCE_PORT=9000\n\
             AWS_SYNC_DRY_RUN=1\n\
             AWS_SYNC_SLEEP=true\n\
             AWS_DEFAULT_REGION=us-east-2\n\
             AWS_ACCESS_KEY_ID=AKIAEXAMPLE\n\
             AWS_SECRET_ACCESS_KEY=secret\n",
        )
        .unwrap();

        let cli = Cli {
            target_group_name: Some("from-flag".to_string()),
            ..Cli::default()
        };
        let config = Config::resolve(cli, &env_file).unwrap();

        assert_eq!(config.target_group_name, "from-flag");
        assert_eq!(config.instance_name_prefix, "api-");
        assert_eq!(config.instance_port.get(), 9000);
        assert!(config.dry_run);
        assert_eq!(config.mode, RunMode::SleepForever);
        assert_eq!(config.provider.region.as_deref(), Some("us-east-2"));
        assert_eq!(
            config.provider.static_credentials(),
            Some(("AKIAEXAMPLE", "secret"))
        );
    }

    #[test]
    fn test_flag_overrides_env_file_bool() {
        let env_file = EnvFile::parse("AWS_SYNC_DRY_RUN=true").unwrap();
        let cli = Cli {
            dry_run: Some(false),
            ..required()
        };
        assert!(!Config::resolve(cli, &env_file).unwrap().dry_run);

        let env_file = EnvFile::parse("AWS_SYNC_DRY_RUN=maybe").unwrap();
        assert!(matches!(
            Config::resolve(required(), &env_file),
            Err(ConfigError::Invalid {
                env: ENV_DRY_RUN,
                ..
            })
        ));
    }

    #[test]
    fn test_interval_selects_continuous_mode() {
        let cli = Cli {
            interval_secs: Some("15".to_string()),
            sleep: Some(true),
            max_attempts: Some("5".to_string()),
            concurrency: Some("2".to_string()),
            ..required()
        };
        let config = Config::resolve(cli, &EnvFile::empty()).unwrap();

        assert_eq!(
            config.mode,
            RunMode::Continuous {
                interval: Duration::from_secs(15)
            }
        );
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.concurrency, 2);

        let cli = Cli {
            interval_secs: Some("0".to_string()),
            ..required()
        };
        assert!(Config::resolve(cli, &EnvFile::empty()).is_err());
    }

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "tg-sync",
            "--target-group-name",
            "web-tg",
            "--instance-name-prefix",
            "web-",
            "--instance-port",
            "80",
            "--dry-run",
            "--sleep",
            "false",
        ])
        .unwrap();

        assert_eq!(cli.dry_run, Some(true));
        assert_eq!(cli.sleep, Some(false));
        assert_eq!(cli.instance_port.as_deref(), Some("80"));
    }

    #[test]
    fn test_provider_settings_debug_redacts_secret() {
        let settings = ProviderSettings {
            access_key_id: Some("AKIAEXAMPLE".to_string()),
            secret_access_key: Some("hunter2".to_string()),
            ..ProviderSettings::default()
        };
        let rendered = format!("{settings:?}");
        assert!(rendered.contains("AKIAEXAMPLE"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_lone_access_key_is_rejected() {
        let cli = Cli {
            aws_access_key_id: Some("AKIAEXAMPLE".to_string()),
            ..required()
        };
        assert!(matches!(
            Config::resolve(cli, &EnvFile::empty()),
            Err(ConfigError::Invalid {
                env: ENV_SECRET_ACCESS_KEY,
                ..
            })
        ));

        let env_file = EnvFile::parse("AWS_SECRET_ACCESS_KEY=secret").unwrap();
        assert!(matches!(
            Config::resolve(required(), &env_file),
            Err(ConfigError::Invalid {
                env: ENV_ACCESS_KEY_ID,
                ..
            })
        ));
    }

    #[test]
    fn test_env_file_dotenv_semantics() {
        let env_file = EnvFile::parse(
            "TG_SYNC_TEST_BASE=web\n\
             # comment\n\
             app.mode=dev\n\
             export AWS_SYNC_INSTANCE_NAME_PREFIX=${TG_SYNC_TEST_BASE}-\n\
             AWS_SYNC_TARGET_GROUP_NAME='literal ${TG_SYNC_TEST_BASE}'\n\
             NOTE=\"line one\nline two\"\n",
        )
        .unwrap();

        assert_eq!(env_file.get("AWS_SYNC_INSTANCE_NAME_PREFIX"), Some("web-"));
        assert_eq!(
            env_file.get("AWS_SYNC_TARGET_GROUP_NAME"),
            Some("literal ${TG_SYNC_TEST_BASE}")
        );
        assert_eq!(env_file.get("app.mode"), Some("dev"));
        assert_eq!(env_file.get("NOTE"), Some("line one\nline two"));
        assert_eq!(env_file.len(), 5);
    }

    #[test]
    fn test_env_file_optional_vs_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join(".env");

        assert!(EnvFile::from_path_optional(&missing).unwrap().is_empty());
        assert!(matches!(
            EnvFile::from_path(&missing),
            Err(ConfigError::EnvFile { .. })
        ));

        std::fs::write(&missing, "AWS_DEFAULT_REGION=eu-west-1\n").unwrap();
        let env_file = EnvFile::from_path(&missing).unwrap();
        assert_eq!(env_file.get(ENV_REGION), Some("eu-west-1"));
    }
}
