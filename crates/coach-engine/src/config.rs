//! 設定（TOML）
//!
//! ```toml
//! [engine]
//! path = "/usr/local/bin/stockfish"
//! args = []
//! quit_timeout_ms = 300
//!
//! [session]
//! default_depth = 15
//! eval_timeout_ms = 30000
//! init_timeout_ms = 10000
//! restart_interval_secs = 1800   # 0 で定期再起動なし
//!
//! [session.options]
//! Threads = 1
//! Hash = 64
//! UCI_ShowWDL = false
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_DEPTH: u32 = 15;
pub const DEFAULT_EVAL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RESTART_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const ENGINE_QUIT_TIMEOUT: Duration = Duration::from_millis(300);

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// エンジンプロセス起動時の設定。
#[derive(Deserialize, Clone, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub path: PathBuf,
    pub args: Vec<String>,
    /// ログに出す名前。省略時は実行ファイル名。
    pub label: Option<String>,
    pub quit_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("stockfish"),
            args: Vec::new(),
            label: None,
            quit_timeout_ms: ENGINE_QUIT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl EngineConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    pub fn label(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None => self
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.path.display().to_string()),
        }
    }

    pub fn quit_timeout(&self) -> Duration {
        Duration::from_millis(self.quit_timeout_ms)
    }
}

/// セッション（要求の対応付けとワーカー寿命）の設定
#[derive(Deserialize, Clone, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// `evaluate` で深さが省略されたときの探索深さ
    pub default_depth: u32,
    pub eval_timeout_ms: u64,
    /// `uci` 送信から `uciok` までの待ち時間
    pub init_timeout_ms: u64,
    /// 定期再起動の間隔（秒）。0 で無効。
    pub restart_interval_secs: u64,
    /// ハンドシェイク後に `setoption` で送る UCI オプション
    pub options: BTreeMap<String, toml::Value>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_depth: DEFAULT_DEPTH,
            eval_timeout_ms: DEFAULT_EVAL_TIMEOUT.as_millis() as u64,
            init_timeout_ms: DEFAULT_INIT_TIMEOUT.as_millis() as u64,
            restart_interval_secs: DEFAULT_RESTART_INTERVAL.as_secs(),
            options: BTreeMap::new(),
        }
    }
}

impl SessionConfig {
    pub fn eval_timeout(&self) -> Duration {
        Duration::from_millis(self.eval_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn restart_interval(&self) -> Option<Duration> {
        (self.restart_interval_secs > 0).then(|| Duration::from_secs(self.restart_interval_secs))
    }

    /// "Name=Value" 形式のオプションを追加する（CLI の `--option` 用）。
    pub fn push_option(&mut self, entry: &str) -> Result<(), ConfigError> {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| ConfigError::Invalid(format!("option must be Name=Value: {entry}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::Invalid(format!("empty option name: {entry}")));
        }
        self.options.insert(name.to_string(), toml::Value::String(value.trim().to_string()));
        Ok(())
    }

    /// `setoption` で送る (名前, 値) の組
    pub fn option_pairs(&self) -> impl Iterator<Item = (&str, String)> + '_ {
        self.options.iter().map(|(name, value)| (name.as_str(), option_value(value)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_depth == 0 {
            return Err(ConfigError::Invalid("default_depth must be at least 1".to_string()));
        }
        if self.eval_timeout_ms == 0 {
            return Err(ConfigError::Invalid("eval_timeout_ms must be positive".to_string()));
        }
        if self.init_timeout_ms == 0 {
            return Err(ConfigError::Invalid("init_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}

/// TOML 値を UCI のオプション値表記にする。
fn option_value(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// 設定ファイル全体
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct CoachConfig {
    pub engine: EngineConfig,
    pub session: SessionConfig,
}

impl CoachConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: CoachConfig = toml::from_str(text)?;
        config.session.validate()?;
        Ok(config)
    }
}
