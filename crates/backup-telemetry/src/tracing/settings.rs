//! Subscriber settings.
//!
//! Every subscriber is either disabled or enabled with a set of [`Settings`]. The enabled variants
//! can be constructed from tuples for the common cases, from an [`Option`] to toggle them at
//! runtime, or through [`Settings::builder`].

use std::path::{Path, PathBuf};

/// Re-export to save the end crate from depending on `tracing_appender` directly.
pub use tracing_appender::rolling::Rotation;
use tracing::level_filters::LevelFilter;

/// General settings that apply to any subscriber.
#[derive(Debug, PartialEq, Eq)]
pub struct Settings {
    /// The environment variable used to set the [`LevelFilter`].
    ///
    /// When the environment variable is set, it overrides [`Self::default_level`]. The value is
    /// parsed as a list of `EnvFilter` directives, e.g. `info,backup_operator=debug`.
    pub environment_variable: &'static str,

    /// The [`LevelFilter`] to fall back to if [`Self::environment_variable`] is unset.
    pub default_level: LevelFilter,
}

impl Settings {
    /// Builder methods to override defaults.
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }
}

/// Common behaviour of all subscriber settings.
pub trait SettingsToggle {
    /// Whether the subscriber is enabled.
    fn is_enabled(&self) -> bool;

    /// Whether the subscriber is disabled.
    fn is_disabled(&self) -> bool {
        !self.is_enabled()
    }
}

/// For building [`Settings`] and the subscriber specific settings.
pub struct SettingsBuilder {
    environment_variable: &'static str,
    default_level: LevelFilter,
}

impl Default for SettingsBuilder {
    fn default() -> Self {
        Self {
            environment_variable: "RUST_LOG",
            default_level: LevelFilter::OFF,
        }
    }
}

impl SettingsBuilder {
    /// Set the environment variable used for overriding the [`Settings::default_level`].
    ///
    /// Defaults to `RUST_LOG`.
    pub fn with_environment_variable(mut self, name: &'static str) -> Self {
        self.environment_variable = name;
        self
    }

    /// Set the default [`LevelFilter`].
    ///
    /// Defaults to [`LevelFilter::OFF`].
    pub fn with_default_level(mut self, level: impl Into<LevelFilter>) -> Self {
        self.default_level = level.into();
        self
    }

    /// Continue with the [`ConsoleLogSettings`] specific options.
    pub fn console_log_settings_builder(self) -> ConsoleLogSettingsBuilder {
        ConsoleLogSettingsBuilder {
            common_settings: self.build(),
            log_format: LogFormat::default(),
        }
    }

    /// Continue with the [`FileLogSettings`] specific options.
    pub fn file_log_settings_builder<P>(
        self,
        path: P,
        filename_suffix: impl Into<String>,
    ) -> FileLogSettingsBuilder
    where
        P: AsRef<Path>,
    {
        FileLogSettingsBuilder {
            common_settings: self.build(),
            file_log_dir: path.as_ref().to_path_buf(),
            rotation_period: Rotation::NEVER,
            filename_suffix: filename_suffix.into(),
            max_log_files: None,
        }
    }

    /// Consumes self and returns the common [`Settings`].
    pub fn build(self) -> Settings {
        Settings {
            environment_variable: self.environment_variable,
            default_level: self.default_level,
        }
    }
}

/// Output format of console log events.
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum LogFormat {
    /// Plain, human readable output. ANSI colors can be disabled by setting `NO_COLOR`.
    #[default]
    Plain,

    /// One JSON object per event, suited for log shippers.
    Json,
}

/// Settings of the console log subscriber.
#[derive(Debug, Default, PartialEq, Eq)]
pub enum ConsoleLogSettings {
    #[default]
    Disabled,
    Enabled {
        common_settings: Settings,
        log_format: LogFormat,
    },
}

impl SettingsToggle for ConsoleLogSettings {
    fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }
}

/// For building [`ConsoleLogSettings`].
///
/// <div class="warning">
/// Do not use directly, instead use the [`Settings::builder`] associated function.
/// </div>
pub struct ConsoleLogSettingsBuilder {
    common_settings: Settings,
    log_format: LogFormat,
}

impl ConsoleLogSettingsBuilder {
    pub fn with_log_format(mut self, log_format: LogFormat) -> Self {
        self.log_format = log_format;
        self
    }

    pub fn build(self) -> ConsoleLogSettings {
        ConsoleLogSettings::Enabled {
            common_settings: self.common_settings,
            log_format: self.log_format,
        }
    }
}

impl From<Settings> for ConsoleLogSettings {
    fn from(common_settings: Settings) -> Self {
        Self::Enabled {
            common_settings,
            log_format: LogFormat::default(),
        }
    }
}

impl From<(&'static str, LevelFilter)> for ConsoleLogSettings {
    fn from((environment_variable, default_level): (&'static str, LevelFilter)) -> Self {
        Settings {
            environment_variable,
            default_level,
        }
        .into()
    }
}

impl From<(&'static str, LevelFilter, bool)> for ConsoleLogSettings {
    fn from(
        (environment_variable, default_level, enabled): (&'static str, LevelFilter, bool),
    ) -> Self {
        if enabled {
            (environment_variable, default_level).into()
        } else {
            Self::Disabled
        }
    }
}

impl<T> From<Option<T>> for ConsoleLogSettings
where
    T: Into<Self>,
{
    fn from(settings: Option<T>) -> Self {
        settings.map(Into::into).unwrap_or_default()
    }
}

/// Settings of the rolling file log subscriber. Files are written as JSON.
#[derive(Debug, Default, PartialEq, Eq)]
pub enum FileLogSettings {
    #[default]
    Disabled,
    Enabled {
        common_settings: Settings,

        /// Path to directory for log files.
        file_log_dir: PathBuf,

        /// Log rotation frequency.
        rotation_period: Rotation,

        /// Suffix for log filenames, the service name is used as the prefix.
        filename_suffix: String,

        /// Keep the last `n` files on disk.
        max_log_files: Option<usize>,
    },
}

impl SettingsToggle for FileLogSettings {
    fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }
}

/// For building [`FileLogSettings`].
///
/// <div class="warning">
/// Do not use directly, instead use the [`Settings::builder`] associated function.
/// </div>
pub struct FileLogSettingsBuilder {
    common_settings: Settings,
    file_log_dir: PathBuf,
    rotation_period: Rotation,
    filename_suffix: String,
    max_log_files: Option<usize>,
}

impl FileLogSettingsBuilder {
    /// Set the file rotation period.
    pub fn with_rotation_period(mut self, rotation_period: impl Into<Rotation>) -> Self {
        self.rotation_period = rotation_period.into();
        self
    }

    /// Set the maximum number of log files to keep.
    pub fn with_max_files(mut self, max_log_files: impl Into<Option<usize>>) -> Self {
        self.max_log_files = max_log_files.into();
        self
    }

    pub fn build(self) -> FileLogSettings {
        FileLogSettings::Enabled {
            common_settings: self.common_settings,
            file_log_dir: self.file_log_dir,
            rotation_period: self.rotation_period,
            filename_suffix: self.filename_suffix,
            max_log_files: self.max_log_files,
        }
    }
}

impl<T> From<Option<T>> for FileLogSettings
where
    T: Into<Self>,
{
    fn from(settings: Option<T>) -> Self {
        settings.map(Into::into).unwrap_or_default()
    }
}

/// Settings of the OpenTelemetry trace exporter.
#[derive(Debug, Default, PartialEq, Eq)]
pub enum OtlpTraceSettings {
    #[default]
    Disabled,
    Enabled { common_settings: Settings },
}

impl SettingsToggle for OtlpTraceSettings {
    fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }
}

impl From<Settings> for OtlpTraceSettings {
    fn from(common_settings: Settings) -> Self {
        Self::Enabled { common_settings }
    }
}

impl From<(&'static str, LevelFilter)> for OtlpTraceSettings {
    fn from((environment_variable, default_level): (&'static str, LevelFilter)) -> Self {
        Settings {
            environment_variable,
            default_level,
        }
        .into()
    }
}

impl From<(&'static str, LevelFilter, bool)> for OtlpTraceSettings {
    fn from(
        (environment_variable, default_level, enabled): (&'static str, LevelFilter, bool),
    ) -> Self {
        if enabled {
            (environment_variable, default_level).into()
        } else {
            Self::Disabled
        }
    }
}

impl<T> From<Option<T>> for OtlpTraceSettings
where
    T: Into<Self>,
{
    fn from(settings: Option<T>) -> Self {
        settings.map(Into::into).unwrap_or_default()
    }
}
