use crate::constants::DEFAULT_DOWNLOAD_WORKERS;
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// When the image backend may go to a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotPresent,
    Never,
}

impl FromStr for PullPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(PullPolicy::Always),
            "if-not-present" | "" => Ok(PullPolicy::IfNotPresent),
            "never" => Ok(PullPolicy::Never),
            other => Err(Error::Config(format!("invalid pull policy '{}'", other))),
        }
    }
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PullPolicy::Always => "always",
            PullPolicy::IfNotPresent => "if-not-present",
            PullPolicy::Never => "never",
        };
        f.write_str(s)
    }
}

/// Process-wide settings, read from `CNBKIT_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache_dir: PathBuf,
    pub download_workers: usize,
    pub pull_policy: PullPolicy,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cache_dir = match lookup("CNBKIT_CACHE_DIR") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => {
                let home = lookup("HOME")
                    .ok_or_else(|| Error::Config("HOME environment variable not set".to_string()))?;
                PathBuf::from(home).join(".cnbkit").join("cache")
            }
        };

        let download_workers = match lookup("CNBKIT_DOWNLOAD_WORKERS") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(Error::Config(format!(
                        "CNBKIT_DOWNLOAD_WORKERS must be a positive integer, got '{}'",
                        raw
                    )))
                }
            },
            None => DEFAULT_DOWNLOAD_WORKERS,
        };

        let pull_policy = lookup("CNBKIT_PULL_POLICY")
            .map(|p| p.parse())
            .transpose()?
            .unwrap_or_default();

        let log_json = lookup("CNBKIT_LOG_JSON")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            cache_dir,
            download_workers,
            pull_policy,
            log_json,
        })
    }
}

/// Options recognised by builder assembly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuilderConfig {
    pub flatten: bool,
    /// Negative flattens everything into one layer.
    pub depth: i32,
    /// Module full names (`id@version`) that stay in their own layer.
    pub exclude: BTreeSet<String>,
    /// Fail construction when `io.buildpacks.builder.metadata` is absent.
    pub require_metadata: bool,
}

impl BuilderConfig {
    pub fn flatten_all() -> Self {
        Self {
            flatten: true,
            depth: -1,
            ..Default::default()
        }
    }

    pub fn flatten_depth(depth: i32) -> Self {
        Self {
            flatten: true,
            depth,
            ..Default::default()
        }
    }

    pub fn with_exclude<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn flatten_all_modules(&self) -> bool {
        self.flatten && self.depth < 0
    }
}
