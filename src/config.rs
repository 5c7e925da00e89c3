//! Environment-based configuration.
//!
//! The process reads a dotenv file chosen by `ENV` (`dev`, the default,
//! loads `.env.dev`; `prod` loads `.env`), then resolves the variables
//! below. Everything except the Redis password is required; a missing or
//! malformed value aborts startup with a contextual error.
//!
//! | Variable        | Effect                                  |
//! |-----------------|-----------------------------------------|
//! | `ENV`           | environment name (`dev` / `prod`)       |
//! | `REDIS_HOST`    | KV backend host                         |
//! | `REDIS_PORT`    | KV backend port                         |
//! | `REDIS_PASSWORD`| KV backend password (optional)          |
//! | `REDIS_DB`      | KV backend database index               |
//! | `PUBLIC_KEY`    | path to the PEM SSH host key            |
//! | `HOST`          | base URL used in banner links           |
//! | `HTTP_PORT`     | HTTP listening port                     |
//! | `SSH_PORT`      | SSH listening port                      |

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
}

impl Environment {
    /// Parse an `ENV` value. An unset or empty variable means `dev`.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "" | "dev" => Ok(Self::Dev),
            "prod" => Ok(Self::Prod),
            other => bail!("invalid ENV value {other:?} (expected \"dev\" or \"prod\")"),
        }
    }

    /// Dotenv file loaded for this environment.
    pub fn dotenv_file(self) -> &'static str {
        match self {
            Self::Dev => ".env.dev",
            Self::Prod => ".env",
        }
    }

    pub fn is_dev(self) -> bool {
        self == Self::Dev
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dev => f.write_str("dev"),
            Self::Prod => f.write_str("prod"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: u8,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub env: Environment,
    pub redis: RedisConfig,
    /// Path to the PEM-encoded SSH host key.
    pub host_key_path: String,
    /// Base URL rendered into banner links (e.g. `https://codedrop.sh`).
    pub host: String,
    pub http_port: u16,
    pub ssh_port: u16,
}

/// Load configuration from the environment.
///
/// `env_override` takes precedence over the `ENV` variable; the dotenv pass
/// happens before any other variable is read so the file can supply them.
pub fn load(env_override: Option<&str>) -> Result<Config> {
    let env_name = match env_override {
        Some(name) => name.to_string(),
        None => std::env::var("ENV").unwrap_or_default(),
    };
    let env = Environment::from_name(&env_name)?;

    dotenvy::from_filename(env.dotenv_file())
        .with_context(|| format!("failed to load dotenv file {:?}", env.dotenv_file()))?;

    Ok(Config {
        env,
        redis: RedisConfig {
            host: require("REDIS_HOST")?,
            port: require_parse("REDIS_PORT")?,
            password: std::env::var("REDIS_PASSWORD")
                .ok()
                .filter(|p| !p.is_empty()),
            db: require_parse("REDIS_DB")?,
        },
        host_key_path: require("PUBLIC_KEY")?,
        host: require("HOST")?,
        http_port: require_parse("HTTP_PORT")?,
        ssh_port: require_parse("SSH_PORT")?,
    })
}

fn require(name: &str) -> Result<String> {
    let value = std::env::var(name).with_context(|| format!("{name} is not set"))?;
    if value.is_empty() {
        bail!("{name} is set but empty");
    }
    Ok(value)
}

fn require_parse<T>(name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    require(name)?
        .parse()
        .with_context(|| format!("{name} is not a valid value"))
}
