//! Logging configuration for the gateway and its workers

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Log file name stem; the appender adds the rotation suffix
pub const DEFAULT_FILE_PREFIX: &str = "content-shield.log";

/// Dependencies whose INFO output drowns out the gateway's own events.
/// `tower_http` keeps the request spans from the HTTP trace layer.
const DEPENDENCY_LEVELS: [(&str, LogLevel); 3] = [
    ("sqlx", LogLevel::Warn),
    ("hyper", LogLevel::Warn),
    ("tower_http", LogLevel::Info),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per event, for log shippers
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

/// How often the log file rolls over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    Never,
}

/// The `[logging]` section of the protection config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,

    /// Where rolled files go; `logs/` under the working directory when unset
    pub log_directory: Option<PathBuf>,
    pub file_prefix: String,
    pub rotation: RotationStrategy,

    /// Per-target overrides, e.g. `content_shield::jobs = "debug"` while
    /// chasing a stuck blur job
    pub module_levels: BTreeMap<String, LogLevel>,

    /// Cap sqlx, hyper and tower_http at the levels in `DEPENDENCY_LEVELS`
    /// unless `module_levels` names them
    pub quiet_dependencies: bool,

    pub include_target: bool,
    pub include_file_info: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
            output: LogOutput::Console,
            log_directory: None,
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            rotation: RotationStrategy::Daily,
            module_levels: BTreeMap::new(),
            quiet_dependencies: true,
            include_target: true,
            include_file_info: false,
        }
    }
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_log_directory(mut self, dir: PathBuf) -> Self {
        self.log_directory = Some(dir);
        self
    }

    pub fn with_module_level(mut self, module: impl Into<String>, level: LogLevel) -> Self {
        self.module_levels.insert(module.into(), level);
        self
    }

    pub fn with_quiet_dependencies(mut self, quiet: bool) -> Self {
        self.quiet_dependencies = quiet;
        self
    }

    /// Effective per-target levels: dependency caps first, then overrides
    pub fn target_levels(&self) -> BTreeMap<String, LogLevel> {
        let mut levels = BTreeMap::new();
        if self.quiet_dependencies {
            for (target, cap) in DEPENDENCY_LEVELS {
                // never louder than the global level
                levels.insert(target.to_string(), cap.max(self.level));
            }
        }
        levels.extend(self.module_levels.iter().map(|(k, v)| (k.clone(), *v)));
        levels
    }

    /// Filter directive string in `EnvFilter` syntax, targets sorted
    pub fn filter_directives(&self) -> String {
        let mut directives = vec![self.level.as_str().to_string()];
        directives.extend(
            self.target_levels()
                .into_iter()
                .map(|(target, level)| format!("{}={}", target, level)),
        );
        directives.join(",")
    }

    pub fn writes_file(&self) -> bool {
        matches!(self.output, LogOutput::File | LogOutput::Both)
    }

    pub fn file_directory(&self) -> PathBuf {
        self.log_directory.clone().unwrap_or_else(|| PathBuf::from("logs"))
    }
}
