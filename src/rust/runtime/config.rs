// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    limits,
    timer::TickSource,
};
use ::std::{
    fs::File,
    io::Read,
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

// Fiber runtime options.
mod fiber_config {
    pub const SECTION_NAME: &str = "fiberlib";
    // Size of each fiber stack, in bytes.
    pub const STACK_SIZE: &str = "stack_size";
    // Length of a preemption quantum, in microseconds.
    pub const QUANTUM_US: &str = "quantum_us";
    // Where preemption ticks come from.
    pub const TICK_SOURCE: &str = "tick_source";
    // Default log specification, overridden by RUST_LOG.
    pub const LOG_SPEC: &str = "log_spec";
}

/// Prefix of environment variables that override configuration file values.
const ENV_PREFIX: &str = "FIBERLIB_";

/// Log specification used when none is configured.
const LOG_SPEC_DEFAULT: &str = "info";

//======================================================================================================================
// Structures
//======================================================================================================================

/// Fiber runtime configuration, as read from a YAML document.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

/// Resolved settings of a fiber runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Size of each fiber stack, in bytes.
    pub stack_size: usize,
    /// Time slice between preemption ticks.
    pub quantum: Duration,
    /// Source of preemption ticks.
    pub tick_source: TickSource,
    /// Default log specification.
    pub log_spec: String,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

/// Common associated functions for the configuration object.
impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        Self::from_yaml_str(&config_s)
    }

    /// Parses a YAML document into a [Config] object.
    pub fn from_yaml_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("malformed configuration: {:?}", e);
                error!("from_yaml_str(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        let config_obj: &Yaml = match &config[..] {
            &[ref c] => c,
            _ => return Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        };

        Ok(Self { 0: config_obj.clone() })
    }

    /// Resolves every option, applying environment overrides and defaults.
    pub fn options(&self) -> Result<RuntimeOptions, Fail> {
        Ok(RuntimeOptions {
            stack_size: self.stack_size()?,
            quantum: self.quantum()?,
            tick_source: self.tick_source()?,
            log_spec: self.log_spec()?,
        })
    }

    /// Reads the fiber section. A missing section means "use the defaults".
    fn get_fiber_config(&self) -> Result<Option<&Yaml>, Fail> {
        let section: &Yaml = self.0.index(fiber_config::SECTION_NAME);
        match section {
            Yaml::BadValue => Ok(None),
            Yaml::Hash(_) => Ok(Some(section)),
            _ => {
                let message: String = format!("parameter \"{}\" has unexpected type", fiber_config::SECTION_NAME);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Reads the stack size from the environment variable first and then the underlying configuration file.
    pub fn stack_size(&self) -> Result<usize, Fail> {
        let stack_size: usize = if let Some(size) = Self::get_typed_env_option(fiber_config::STACK_SIZE)? {
            size
        } else {
            match self.get_fiber_config()? {
                Some(section) if Self::has_option(section, fiber_config::STACK_SIZE) => {
                    Self::get_int_option(section, fiber_config::STACK_SIZE)?
                },
                _ => limits::STACK_SIZE_DEFAULT,
            }
        };

        if stack_size < limits::STACK_SIZE_MIN {
            let cause: String = format!(
                "stack size too small (stack_size={:?}, min={:?})",
                stack_size,
                limits::STACK_SIZE_MIN
            );
            error!("stack_size(): {}", cause);
            return Err(Fail::new(libc::ERANGE, &cause));
        }
        Ok(stack_size)
    }

    /// Reads the preemption quantum from the environment variable first and then the underlying configuration file.
    pub fn quantum(&self) -> Result<Duration, Fail> {
        let quantum_us: u64 = if let Some(quantum) = Self::get_typed_env_option(fiber_config::QUANTUM_US)? {
            quantum
        } else {
            match self.get_fiber_config()? {
                Some(section) if Self::has_option(section, fiber_config::QUANTUM_US) => {
                    Self::get_int_option(section, fiber_config::QUANTUM_US)?
                },
                _ => limits::QUANTUM_US_DEFAULT,
            }
        };

        if quantum_us == 0 {
            let cause: String = format!("quantum must be positive");
            error!("quantum(): {}", cause);
            return Err(Fail::new(libc::ERANGE, &cause));
        }
        Ok(Duration::from_micros(quantum_us))
    }

    /// Reads the tick source from the environment variable first and then the underlying configuration file.
    pub fn tick_source(&self) -> Result<TickSource, Fail> {
        if let Some(source) = Self::get_typed_env_option(fiber_config::TICK_SOURCE)? {
            return Ok(source);
        }
        match self.get_fiber_config()? {
            Some(section) if Self::has_option(section, fiber_config::TICK_SOURCE) => {
                Self::get_typed_str_option(section, fiber_config::TICK_SOURCE, |val: &str| val.parse().ok())
            },
            _ => Ok(TickSource::default()),
        }
    }

    /// Reads the default log specification from the environment variable first and then the underlying
    /// configuration file.
    pub fn log_spec(&self) -> Result<String, Fail> {
        if let Some(spec) = Self::get_typed_env_option(fiber_config::LOG_SPEC)? {
            return Ok(spec);
        }
        match self.get_fiber_config()? {
            Some(section) if Self::has_option(section, fiber_config::LOG_SPEC) => {
                Self::get_typed_str_option(section, fiber_config::LOG_SPEC, |val: &str| Some(val.to_string()))
            },
            _ => Ok(LOG_SPEC_DEFAULT.to_string()),
        }
    }

    //==================================================================================================================
    // Static Functions
    //==================================================================================================================

    /// Checks whether `index` is present in `yaml`.
    fn has_option(yaml: &Yaml, index: &str) -> bool {
        !matches!(yaml.index(index), Yaml::BadValue)
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

    /// Same as `Self::get_typed_option`, but parses a string value.
    fn get_typed_str_option<T, Fn>(yaml: &Yaml, index: &str, parser: Fn) -> Result<T, Fail>
    where
        Fn: FnOnce(&str) -> Option<T>,
    {
        let option: &Yaml = Self::get_option(yaml, index)?;
        if let Some(value) = option.as_str() {
            if let Some(value) = parser(value) {
                return Ok(value);
            }
        }
        let message: String = format!("parameter {} has unexpected type", index);
        Err(Fail::new(libc::EINVAL, message.as_str()))
    }

    /// Get value where the environment value overrides the config file if it exists.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        // Check for the environment variable.
        if let Ok(var) = ::std::env::var(format!("{}{}", ENV_PREFIX, index.to_uppercase())) {
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

impl RuntimeOptions {
    /// Overrides the stack size.
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Overrides the preemption quantum.
    pub fn with_quantum(mut self, quantum: Duration) -> Self {
        self.quantum = quantum;
        self
    }

    /// Overrides the tick source.
    pub fn with_tick_source(mut self, tick_source: TickSource) -> Self {
        self.tick_source = tick_source;
        self
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Built-in defaults, ignoring the environment.
impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            stack_size: limits::STACK_SIZE_DEFAULT,
            quantum: Duration::from_micros(limits::QUANTUM_US_DEFAULT),
            tick_source: TickSource::default(),
            log_spec: LOG_SPEC_DEFAULT.to_string(),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
