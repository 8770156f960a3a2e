use crate::scheduler::CronSchedule;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

const MASK: &str = "******";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid { field: field.into(), reason: reason.into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub api: ApiConf,
    pub speedtest: SpeedTestConf,
    pub schedule: ScheduleConf,
    pub heartbeat: HeartbeatConf,
    pub propagation: Vec<PropagationTarget>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConf {
    pub listen: String,
    pub api_key: Option<String>,
}

impl Default for ApiConf {
    fn default() -> Self {
        Self { listen: "0.0.0.0:6788".into(), api_key: None }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SpeedTestConf {
    pub binary: PathBuf,
    /// Working directory of the tool; relative paths below resolve against it.
    pub work_dir: PathBuf,
    pub output_file: PathBuf,
    pub timeout_seconds: u64,
    pub ipv4: bool,
    pub ipv6: bool,
    pub ipv4_file: PathBuf,
    pub ipv6_file: PathBuf,
    pub options: ToolOptions,
    /// Appended verbatim after the generated flags (split with shell-words).
    pub extra_args: Option<String>,
}

impl Default for SpeedTestConf {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("./cfst/CloudflareST"),
            work_dir: PathBuf::from("./cfst"),
            output_file: PathBuf::from("result.csv"),
            timeout_seconds: 600,
            ipv4: true,
            ipv6: false,
            ipv4_file: PathBuf::from("ip.txt"),
            ipv6_file: PathBuf::from("ipv6.txt"),
            options: ToolOptions::default(),
            extra_args: None,
        }
    }
}

/// CloudflareSpeedTest flags. `None` / `false` leaves the tool's own default.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ToolOptions {
    pub n: Option<u32>,
    pub t: Option<u32>,
    pub dn: Option<u32>,
    pub dt: Option<u32>,
    pub tp: Option<u16>,
    pub url: Option<String>,
    pub httping: bool,
    pub httping_code: Option<String>,
    pub cfcolo: Option<String>,
    pub tl: Option<u32>,
    pub tll: Option<u32>,
    pub tlr: Option<f64>,
    pub sl: Option<f64>,
    pub p: Option<u32>,
    pub ip: Option<String>,
    pub dd: bool,
    pub allip: bool,
    pub debug: bool,
}

impl Default for ToolOptions {
    fn default() -> Self {
        Self {
            n: Some(200),
            t: Some(4),
            dn: Some(10),
            dt: Some(10),
            tp: None,
            url: None,
            httping: false,
            httping_code: None,
            cfcolo: None,
            tl: Some(200),
            tll: None,
            tlr: None,
            sl: None,
            p: Some(0),
            ip: None,
            dd: false,
            allip: false,
            debug: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ScheduleConf {
    pub optimize_cron: String,
    pub heartbeat_cron: String,
    pub run_on_startup: bool,
}

impl Default for ScheduleConf {
    fn default() -> Self {
        Self {
            optimize_cron: "0 */4 * * *".into(),
            heartbeat_cron: "*/5 * * * *".into(),
            run_on_startup: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HeartbeatConf {
    pub enabled: bool,
    pub count: u32,
    pub timeout_seconds: u32,
}

impl Default for HeartbeatConf {
    fn default() -> Self {
        Self { enabled: true, count: 1, timeout_seconds: 2 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetFormat {
    /// Marked `domain ip` block in a hosts-style file (OpenWRT, mosdns).
    HostsBlock,
    /// `filtering.rewrites` list of an AdGuard Home YAML config.
    RewriteList,
}

/// Remote device that receives the best IP.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PropagationTarget {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    #[serde(default)]
    pub passphrase: Option<String>,
    pub remote_path: String,
    pub format: TargetFormat,
    #[serde(default)]
    pub post_update_command: Option<String>,
    #[serde(default = "default_remote_timeout")]
    pub timeout_seconds: u64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_remote_timeout() -> u64 {
    10
}

impl PropagationTarget {
    pub fn post_command(&self) -> Option<&str> {
        self.post_update_command.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }
}

impl SpeedTestConf {
    fn resolve(&self, path: &Path) -> PathBuf {
        let joined = if path.is_absolute() { path.to_path_buf() } else { self.work_dir.join(path) };
        std::path::absolute(&joined).unwrap_or(joined)
    }

    /// Absolute path of the tool; relative paths resolve against the daemon's cwd.
    pub fn binary_path(&self) -> PathBuf {
        std::path::absolute(&self.binary).unwrap_or_else(|_| self.binary.clone())
    }

    pub fn work_dir_path(&self) -> PathBuf {
        std::path::absolute(&self.work_dir).unwrap_or_else(|_| self.work_dir.clone())
    }

    pub fn output_path(&self) -> PathBuf {
        self.resolve(&self.output_file)
    }

    pub fn ipv4_path(&self) -> PathBuf {
        self.resolve(&self.ipv4_file)
    }

    pub fn ipv6_path(&self) -> PathBuf {
        self.resolve(&self.ipv6_file)
    }

    fn extra_args(&self) -> Result<Vec<String>, shell_words::ParseError> {
        match self.extra_args.as_deref() {
            Some(raw) => shell_words::split(raw),
            None => Ok(Vec::new()),
        }
    }
}

/// Builds the tool's argv (without the program name) from the config alone.
/// The output file always comes last so the tool writes where the optimizer reads.
pub fn build_tool_args(conf: &SpeedTestConf) -> Vec<String> {
    let o = &conf.options;
    let mut args = Vec::new();

    let mut push = |flag: &str, value: String| {
        args.push(format!("-{flag}"));
        args.push(value);
    };
    let numeric = [
        ("n", o.n),
        ("t", o.t),
        ("dn", o.dn),
        ("dt", o.dt),
        ("tp", o.tp.map(u32::from)),
        ("tl", o.tl),
        ("tll", o.tll),
    ];
    for (flag, value) in numeric {
        if let Some(v) = value {
            push(flag, v.to_string());
        }
    }
    for (flag, value) in [("tlr", o.tlr), ("sl", o.sl)] {
        if let Some(v) = value {
            push(flag, v.to_string());
        }
    }
    if let Some(p) = o.p {
        push("p", p.to_string());
    }
    let strings = [
        ("url", &o.url),
        ("httping_code", &o.httping_code),
        ("cfcolo", &o.cfcolo),
        ("ip", &o.ip),
    ];
    for (flag, value) in strings {
        if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            push(flag, v.to_string());
        }
    }
    for (flag, on) in [("httping", o.httping), ("dd", o.dd), ("allip", o.allip), ("debug", o.debug)] {
        if on {
            args.push(format!("-{flag}"));
        }
    }
    if conf.ipv4 {
        args.push("-f".into());
        args.push(conf.ipv4_path().display().to_string());
    }
    if conf.ipv6 {
        args.push("-f".into());
        args.push(conf.ipv6_path().display().to_string());
    }
    // validate() guarantees extra_args splits cleanly
    args.extend(conf.extra_args().unwrap_or_default());
    args.push("-o".into());
    args.push(conf.output_path().display().to_string());
    args
}

impl KernelConfig {
    pub fn from_yaml_str(txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(txt)?)
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let st = &self.speedtest;
        if st.binary.as_os_str().is_empty() {
            return Err(ConfigError::invalid("speedtest.binary", "must not be empty"));
        }
        if st.timeout_seconds == 0 {
            return Err(ConfigError::invalid("speedtest.timeout_seconds", "must be > 0"));
        }
        if let Some(tlr) = st.options.tlr {
            if !(0.0..=1.0).contains(&tlr) {
                return Err(ConfigError::invalid("speedtest.options.tlr", "must be within 0.0..=1.0"));
            }
        }
        let extra = st
            .extra_args()
            .map_err(|e| ConfigError::invalid("speedtest.extra_args", e.to_string()))?;
        if let Some(flag) = extra.iter().find(|a| matches!(a.as_str(), "-o" | "--output" | "-f")) {
            return Err(ConfigError::invalid(
                "speedtest.extra_args",
                format!("{flag} is managed by the kernel (see output_file / ipv4_file / ipv6_file)"),
            ));
        }

        CronSchedule::parse(&self.schedule.optimize_cron)
            .map_err(|e| ConfigError::invalid("schedule.optimize_cron", e.to_string()))?;
        CronSchedule::parse(&self.schedule.heartbeat_cron)
            .map_err(|e| ConfigError::invalid("schedule.heartbeat_cron", e.to_string()))?;

        let mut names = HashSet::new();
        for (i, t) in self.propagation.iter().enumerate() {
            let field = |f: &str| format!("propagation[{i}].{f}");
            if t.name.trim().is_empty() {
                return Err(ConfigError::invalid(field("name"), "must not be empty"));
            }
            if !names.insert(t.name.as_str()) {
                return Err(ConfigError::invalid(field("name"), format!("duplicate target `{}`", t.name)));
            }
            if !t.enabled {
                continue;
            }
            if t.host.trim().is_empty() {
                return Err(ConfigError::invalid(field("host"), "must not be empty"));
            }
            if t.username.trim().is_empty() {
                return Err(ConfigError::invalid(field("username"), "must not be empty"));
            }
            if t.password.is_none() && t.private_key.is_none() {
                return Err(ConfigError::invalid(field("password"), "password or private_key required"));
            }
            if t.remote_path.trim().is_empty() {
                return Err(ConfigError::invalid(field("remote_path"), "must not be empty"));
            }
            if t.timeout_seconds == 0 {
                return Err(ConfigError::invalid(field("timeout_seconds"), "must be > 0"));
            }
        }
        Ok(())
    }

    /// Copy safe to show over the API.
    pub fn redacted(&self) -> Self {
        let mut cfg = self.clone();
        if cfg.api.api_key.is_some() {
            cfg.api.api_key = Some(MASK.into());
        }
        for t in &mut cfg.propagation {
            if t.password.is_some() {
                t.password = Some(MASK.into());
            }
            if t.passphrase.is_some() {
                t.passphrase = Some(MASK.into());
            }
        }
        cfg
    }

    /// Puts back secrets that came in masked (a redacted config sent back for editing).
    pub fn restore_secrets(&mut self, current: &KernelConfig) {
        if self.api.api_key.as_deref() == Some(MASK) {
            self.api.api_key = current.api.api_key.clone();
        }
        for t in &mut self.propagation {
            let Some(old) = current.propagation.iter().find(|o| o.name == t.name) else { continue };
            if t.password.as_deref() == Some(MASK) {
                t.password = old.password.clone();
            }
            if t.passphrase.as_deref() == Some(MASK) {
                t.passphrase = old.passphrase.clone();
            }
        }
    }

    pub fn enabled_targets(&self) -> Vec<PropagationTarget> {
        self.propagation.iter().filter(|t| t.enabled).cloned().collect()
    }
}

pub fn config_path() -> PathBuf {
    PathBuf::from(std::env::var("CFOPT_CONFIG").unwrap_or_else(|_| "cfopt.yaml".into()))
}

/// Loads and validates the config. A missing file means defaults.
pub async fn load_config(path: &Path) -> Result<KernelConfig, ConfigError> {
    let mut cfg = if path.exists() {
        let txt = fs::read_to_string(path).await?;
        KernelConfig::from_yaml_str(&txt)?
    } else {
        warn!("no config at {}, using defaults", path.display());
        KernelConfig::default()
    };

    if let Ok(key) = std::env::var("CFOPT_API_KEY") {
        if !key.is_empty() {
            cfg.api.api_key = Some(key);
        }
    }

    cfg.validate()?;
    info!(
        "config loaded: {} propagation target(s), optimize `{}`, heartbeat `{}`",
        cfg.enabled_targets().len(),
        cfg.schedule.optimize_cron,
        cfg.schedule.heartbeat_cron
    );
    Ok(cfg)
}

pub async fn save_config(path: &Path, cfg: &KernelConfig) -> Result<(), ConfigError> {
    cfg.validate()?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, cfg.to_yaml_string()?).await?;
    Ok(())
}
