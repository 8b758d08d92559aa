// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    env,
    fs,
    ops::Index,
    str::FromStr,
    time::Duration,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Environment variable that names the configuration file.
pub const CONFIG_PATH_VAR: &str = "CONFIG_PATH";

// Runtime options.
mod runtime_config {
    pub const SECTION_NAME: &str = "cofiber";
    // Number of reactor threads.
    pub const REACTOR_THREADS: &str = "reactor_threads";
    // Maximum number of readiness events dispatched by a single epoll round.
    pub const EPOLL_BATCH_SIZE: &str = "epoll_batch_size";
    // Upper bound on how long an idle reactor sleeps inside epoll.
    pub const MAX_PARK_MILLIS: &str = "max_park_millis";
}

/// Built-in configuration.
const DEFAULT_CONFIG: &str = r#"
cofiber:
  reactor_threads: 1
  epoll_batch_size: 1024
  max_park_millis: 100
"#;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Runtime configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let config_s: String = match fs::read_to_string(config_path) {
            Ok(s) => s,
            Err(e) => {
                let cause: String = format!("failed to read configuration file (path={:?}): {}", config_path, e);
                error!("new(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        Self::parse(&config_s)
    }

    /// Parses the configuration from a string.
    pub fn parse(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("malformed configuration: {}", e);
                error!("parse(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let config_obj: &Yaml = match &config[..] {
            &[ref c] => c,
            _ => return Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        };

        Ok(Self(config_obj.clone()))
    }

    /// Reads the file named by [CONFIG_PATH_VAR] if it is set, the built-in configuration otherwise.
    pub fn from_env() -> Result<Self, Fail> {
        match env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::new(&path),
            Err(_) => Ok(Self::default()),
        }
    }

    fn get_runtime_config(&self) -> Option<&Yaml> {
        Self::get_subsection(&self.0, runtime_config::SECTION_NAME).ok()
    }

    /// Number of reactor threads. Must be at least one.
    pub fn reactor_threads(&self) -> Result<usize, Fail> {
        let threads: usize = self.get_usize(runtime_config::REACTOR_THREADS, 1)?;
        if threads == 0 {
            return Err(Fail::new(libc::EINVAL, "reactor_threads must be at least one"));
        }
        Ok(threads)
    }

    /// Number of readiness events a reactor dispatches per round. Must be at least one.
    pub fn epoll_batch_size(&self) -> Result<usize, Fail> {
        let batch_size: usize = self.get_usize(runtime_config::EPOLL_BATCH_SIZE, 1024)?;
        if batch_size == 0 {
            return Err(Fail::new(libc::EINVAL, "epoll_batch_size must be at least one"));
        }
        Ok(batch_size)
    }

    /// Longest time an idle reactor waits for readiness before yielding back to its scheduler.
    pub fn max_park(&self) -> Result<Duration, Fail> {
        let millis: u64 = if let Some(millis) = Self::get_typed_env_option(runtime_config::MAX_PARK_MILLIS)? {
            millis
        } else if let Some(section) = self.get_runtime_config() {
            match Self::get_option(section, runtime_config::MAX_PARK_MILLIS) {
                Ok(_) => Self::get_int_option(section, runtime_config::MAX_PARK_MILLIS)?,
                Err(_) => 100,
            }
        } else {
            100
        };
        Ok(Duration::from_millis(millis))
    }

    /// Reads an unsigned option from the environment first, then the configuration file, then falls back to `default`.
    fn get_usize(&self, index: &str, default: usize) -> Result<usize, Fail> {
        if let Some(value) = Self::get_typed_env_option(index)? {
            return Ok(value);
        }
        match self.get_runtime_config() {
            Some(section) if Self::get_option(section, index).is_ok() => Self::get_int_option(section, index),
            _ => Ok(default),
        }
    }

    /// Index `yaml` to find the value at `index`, validating that it is a hash.
    fn get_subsection<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        let section: &'a Yaml = Self::get_option(yaml, index)?;
        match section {
            Yaml::Hash(_) => Ok(section),
            _ => {
                let message: String = format!("parameter \"{}\" has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Index `yaml` to find the value at `index`, validating that the index exists.
    fn get_option<'a>(yaml: &'a Yaml, index: &str) -> Result<&'a Yaml, Fail> {
        match yaml.index(index) {
            Yaml::BadValue => {
                let message: String = format!("missing configuration option \"{}\"", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
            value => Ok(value),
        }
    }

    /// Index `yaml` to find the value at `index`, validating that it exists and that the receiver returns Some(_).
    fn get_typed_option<'a, T, Fn>(yaml: &'a Yaml, index: &str, receiver: Fn) -> Result<T, Fail>
    where
        Fn: FnOnce(&'a Yaml) -> Option<T>,
    {
        let option: &'a Yaml = Self::get_option(yaml, index)?;
        match receiver(option) {
            Some(value) => Ok(value),
            None => {
                let message: String = format!("parameter {} has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Get value where the environment value overrides the config file if it exists.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        if let Ok(var) = env::var(index.to_uppercase()) {
            if let Ok(value) = var.as_str().parse() {
                return Ok(Some(value));
            } else {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            }
        }
        Ok(None)
    }

    /// Similar to `get_typed_option` using `Yaml::as_i64` as the receiver, but additionally verifies that the
    /// destination type may hold the i64 value.
    fn get_int_option<T: TryFrom<i64>>(yaml: &Yaml, index: &str) -> Result<T, Fail> {
        let val: i64 = Self::get_typed_option(yaml, index, &Yaml::as_i64)?;
        match T::try_from(val) {
            Ok(val) => Ok(val),
            _ => {
                let message: String = format!("parameter \"{}\" is out of range", index);
                Err(Fail::new(libc::ERANGE, message.as_str()))
            },
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Config {
    fn default() -> Self {
        let config: Vec<Yaml> = YamlLoader::load_from_str(DEFAULT_CONFIG).unwrap_or_default();
        Self(config.into_iter().next().unwrap_or(Yaml::Null))
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
