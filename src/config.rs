//! 延迟 Stage 的配置面板
//!
//! 控制线程 (stdin / 参数文件) 改字段，驱动线程每个 tick 取一次快照。

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::packet::Direction;

pub const DELAY_MIN_MS: u32 = 0;
pub const DELAY_MAX_MS: u32 = 15000;
pub const DELAY_DEFAULT_MS: u32 = 50;

pub const JITTER_MIN_MS: u32 = 0;
pub const JITTER_MAX_MS: u32 = 2000;
pub const JITTER_DEFAULT_MS: u32 = 0;

// ==========================================
// 1. 每个 tick 用的只读快照
// ==========================================
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LagSettings {
    pub enabled: bool,
    pub inbound: bool,
    pub outbound: bool,
    pub delay_ms: u32,
    pub jitter_ms: u32,
}

impl LagSettings {
    /// 这个方向的包归不归我管
    #[inline]
    pub fn captures(&self, direction: Direction) -> bool {
        (self.inbound && direction.is_inbound()) || (self.outbound && direction.is_outbound())
    }
}

// ==========================================
// 2. 运行时可改的配置 (无锁原子字段)
// ==========================================
#[derive(Clone, Debug)]
pub struct LagConfig {
    enabled: Arc<AtomicBool>,
    inbound: Arc<AtomicBool>,
    outbound: Arc<AtomicBool>,
    delay_ms: Arc<AtomicU32>,
    jitter_ms: Arc<AtomicU32>,
}

impl Default for LagConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LagConfig {
    pub fn new() -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(false)),
            // 两个方向默认都勾上，免得用户以为没生效
            inbound: Arc::new(AtomicBool::new(true)),
            outbound: Arc::new(AtomicBool::new(true)),
            delay_ms: Arc::new(AtomicU32::new(DELAY_DEFAULT_MS)),
            jitter_ms: Arc::new(AtomicU32::new(JITTER_DEFAULT_MS)),
        }
    }

    #[inline]
    pub fn snapshot(&self) -> LagSettings {
        LagSettings {
            enabled: self.enabled.load(Ordering::Relaxed),
            inbound: self.inbound.load(Ordering::Relaxed),
            outbound: self.outbound.load(Ordering::Relaxed),
            delay_ms: self.delay_ms.load(Ordering::Relaxed),
            jitter_ms: self.jitter_ms.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_inbound(&self, inbound: bool) {
        self.inbound.store(inbound, Ordering::Relaxed);
    }

    pub fn set_outbound(&self, outbound: bool) {
        self.outbound.store(outbound, Ordering::Relaxed);
    }

    pub fn set_delay_ms(&self, delay_ms: u32) -> Result<(), ConfigError> {
        check_range("delay", delay_ms, DELAY_MIN_MS, DELAY_MAX_MS)?;
        self.delay_ms.store(delay_ms, Ordering::Relaxed);
        Ok(())
    }

    pub fn set_jitter_ms(&self, jitter_ms: u32) -> Result<(), ConfigError> {
        check_range("jitter", jitter_ms, JITTER_MIN_MS, JITTER_MAX_MS)?;
        self.jitter_ms.store(jitter_ms, Ordering::Relaxed);
        Ok(())
    }

    /// 启动参数注入：`<id>`, `<id>-inbound`, `<id>-outbound`, `<id>-time`。
    /// 抖动没有持久化的 key。
    pub fn apply_parameters(&self, id: &str, params: &Parameters) -> Result<(), ConfigError> {
        // 先全部解析校验，有一个不合法就一个都不写
        let enabled = params.get(id).map(|v| parse_bool(id, v)).transpose()?;

        let key = format!("{id}-inbound");
        let inbound = params.get(&key).map(|v| parse_bool(&key, v)).transpose()?;

        let key = format!("{id}-outbound");
        let outbound = params.get(&key).map(|v| parse_bool(&key, v)).transpose()?;

        let key = format!("{id}-time");
        let delay = match params.get(&key) {
            Some(value) => {
                let delay = parse_u32(&key, value)?;
                check_range(&key, delay, DELAY_MIN_MS, DELAY_MAX_MS)?;
                Some(delay)
            }
            None => None,
        };

        if let Some(enabled) = enabled {
            self.set_enabled(enabled);
        }
        if let Some(inbound) = inbound {
            self.set_inbound(inbound);
        }
        if let Some(outbound) = outbound {
            self.set_outbound(outbound);
        }
        if let Some(delay) = delay {
            self.delay_ms.store(delay, Ordering::Relaxed);
        }
        Ok(())
    }

    /// 导出可持久化的那几个 key
    pub fn to_parameters(&self, id: &str) -> Parameters {
        let snap = self.snapshot();
        let mut params = Parameters::new();
        params.insert(id, on_off(snap.enabled));
        params.insert(format!("{id}-inbound"), on_off(snap.inbound));
        params.insert(format!("{id}-outbound"), on_off(snap.outbound));
        params.insert(format!("{id}-time"), snap.delay_ms.to_string());
        params
    }
}

fn on_off(value: bool) -> &'static str {
    if value { "on" } else { "off" }
}

fn check_range(key: &str, value: u32, min: u32, max: u32) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            key: key.to_string(),
            value: value as i64,
            min: min as i64,
            max: max as i64,
        });
    }
    Ok(())
}

pub fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    let trimmed = value.trim();
    match trimmed.parse::<i64>() {
        Ok(n) if n < 0 || n > u32::MAX as i64 => Err(ConfigError::OutOfRange {
            key: key.to_string(),
            value: n,
            min: 0,
            max: u32::MAX as i64,
        }),
        Ok(n) => Ok(n as u32),
        Err(_) => Err(ConfigError::InvalidInteger {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

// ==========================================
// 3. 持久化参数表 (key -> value，JSON 文件)
// ==========================================
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters(BTreeMap<String, String>);

impl Parameters {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// 后来的覆盖先来的
    pub fn merge(&mut self, other: Parameters) {
        self.0.extend(other.0);
    }

    /// 解析 `key=value`
    pub fn parse_pair(pair: &str) -> Result<(String, String), ConfigError> {
        match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok((key.trim().to_string(), value.trim().to_string()))
            }
            _ => Err(ConfigError::Malformed(pair.to_string())),
        }
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Result<Self, ConfigError> {
        let mut params = Self::new();
        for pair in pairs {
            let (key, value) = Self::parse_pair(pair)?;
            params.insert(key, value);
        }
        Ok(params)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }
}

// ==========================================
// 4. 运行时指令 (stdin 一行一条)
// ==========================================

/// 指令：
/// - `<id> on|off`
/// - `<id>-inbound on|off` / `<id>-outbound on|off`
/// - `<id>-time <ms>` / `<id>-jitter <ms>`
/// - `status`
pub fn apply_cmd(config: &LagConfig, id: &str, cmd: &str) {
    let parts: Vec<&str> = cmd.split_whitespace().collect();
    if parts.is_empty() {
        return;
    }

    if parts[0] == "status" {
        let snap = config.snapshot();
        info!(
            "{}: {} inbound={} outbound={} delay={}ms jitter={}ms",
            id,
            on_off(snap.enabled),
            on_off(snap.inbound),
            on_off(snap.outbound),
            snap.delay_ms,
            snap.jitter_ms
        );
        return;
    }

    if parts.len() != 2 {
        warn!("usage: <{}|{}-inbound|{}-outbound|{}-time|{}-jitter> <value>", id, id, id, id, id);
        return;
    }
    let (key, value) = (parts[0], parts[1]);

    let result = match key.strip_prefix(id) {
        Some("") => parse_bool(key, value).map(|v| config.set_enabled(v)),
        Some("-inbound") => parse_bool(key, value).map(|v| config.set_inbound(v)),
        Some("-outbound") => parse_bool(key, value).map(|v| config.set_outbound(v)),
        Some("-time") => parse_u32(key, value).and_then(|v| config.set_delay_ms(v)),
        Some("-jitter") => parse_u32(key, value).and_then(|v| config.set_jitter_ms(v)),
        _ => {
            warn!("unknown command: {}", key);
            return;
        }
    };

    match result {
        Ok(()) => info!("{}: {}", key, value),
        Err(e) => warn!("{}", e),
    }
}

pub fn spawn_config_listener(config: LagConfig, id: &'static str) {
    std::thread::spawn(move || {
        use std::io::BufRead;
        let stdin = std::io::stdin();
        for line in stdin.lock().lines().map_while(Result::ok) {
            apply_cmd(&config, id, line.trim());
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let snap = LagConfig::new().snapshot();
        assert!(!snap.enabled);
        assert!(snap.inbound);
        assert!(snap.outbound);
        assert_eq!(snap.delay_ms, 50);
        assert_eq!(snap.jitter_ms, 0);
    }

    #[test]
    fn clones_share_state() {
        let config = LagConfig::new();
        let control = config.clone();
        control.set_delay_ms(300).unwrap();
        control.set_enabled(true);
        assert_eq!(config.snapshot().delay_ms, 300);
        assert!(config.enabled());
    }

    #[test]
    fn setters_reject_out_of_range() {
        let config = LagConfig::new();
        assert!(config.set_delay_ms(15000).is_ok());
        assert!(matches!(
            config.set_delay_ms(15001),
            Err(ConfigError::OutOfRange { max: 15000, .. })
        ));
        assert!(config.set_jitter_ms(2000).is_ok());
        assert!(config.set_jitter_ms(2001).is_err());

        let snap = config.snapshot();
        assert_eq!(snap.delay_ms, 15000);
        assert_eq!(snap.jitter_ms, 2000);
    }

    #[test]
    fn direction_filter() {
        let mut snap = LagConfig::new().snapshot();
        assert!(snap.captures(Direction::Inbound));
        assert!(snap.captures(Direction::Outbound));

        snap.inbound = false;
        assert!(!snap.captures(Direction::Inbound));
        assert!(snap.captures(Direction::Outbound));

        snap.outbound = false;
        assert!(!snap.captures(Direction::Outbound));
    }

    #[test]
    fn apply_parameters_namespaced_by_id() {
        let config = LagConfig::new();
        let params =
            Parameters::from_pairs(["lag=on", "lag-inbound=off", "lag-time=120", "drop-time=9"])
                .unwrap();
        config.apply_parameters("lag", &params).unwrap();

        let snap = config.snapshot();
        assert!(snap.enabled);
        assert!(!snap.inbound);
        assert!(snap.outbound);
        assert_eq!(snap.delay_ms, 120);
    }

    #[test]
    fn apply_parameters_rejects_bad_values() {
        let config = LagConfig::new();

        let params = Parameters::from_pairs(["lag-time=20000"]).unwrap();
        assert!(config.apply_parameters("lag", &params).is_err());

        let params = Parameters::from_pairs(["lag-time=-1"]).unwrap();
        assert!(config.apply_parameters("lag", &params).is_err());

        let params = Parameters::from_pairs(["lag-outbound=maybe"]).unwrap();
        assert!(matches!(
            config.apply_parameters("lag", &params),
            Err(ConfigError::InvalidBool { .. })
        ));

        assert_eq!(config.snapshot().delay_ms, DELAY_DEFAULT_MS);
    }

    #[test]
    fn rejected_parameters_leave_config_untouched() {
        let config = LagConfig::new();
        let params =
            Parameters::from_pairs(["lag=on", "lag-inbound=off", "lag-time=99999"]).unwrap();
        assert!(matches!(
            config.apply_parameters("lag", &params),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert_eq!(config.snapshot(), LagConfig::new().snapshot());

        let params = Parameters::from_pairs(["lag=on", "lag-outbound=sometimes"]).unwrap();
        assert!(config.apply_parameters("lag", &params).is_err());
        assert!(!config.enabled());
    }

    #[test]
    fn malformed_pair() {
        assert!(Parameters::parse_pair("lag-time").is_err());
        assert!(Parameters::parse_pair("=5").is_err());
        assert_eq!(
            Parameters::parse_pair(" lag-time = 7 ").unwrap(),
            ("lag-time".to_string(), "7".to_string())
        );
    }

    #[test]
    fn export_round_trips_through_apply() {
        let config = LagConfig::new();
        config.set_outbound(false);
        config.set_delay_ms(777).unwrap();
        config.set_jitter_ms(40).unwrap();

        let params = config.to_parameters("lag");
        assert_eq!(params.get("lag-outbound"), Some("off"));
        assert_eq!(params.get("lag-time"), Some("777"));
        assert_eq!(params.get("lag-jitter"), None);

        let restored = LagConfig::new();
        restored.apply_parameters("lag", &params).unwrap();
        let snap = restored.snapshot();
        assert!(!snap.outbound);
        assert_eq!(snap.delay_ms, 777);
        assert_eq!(snap.jitter_ms, 0);
    }

    #[test]
    fn save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");

        let mut params = Parameters::new();
        params.insert("lag-time", "250");
        params.insert("lag-inbound", "off");
        params.save(&path).unwrap();

        let loaded = Parameters::load(&path).unwrap();
        assert_eq!(loaded, params);
    }

    #[test]
    fn apply_cmd_updates_fields() {
        let config = LagConfig::new();

        apply_cmd(&config, "lag", "lag on");
        apply_cmd(&config, "lag", "lag-inbound off");
        apply_cmd(&config, "lag", "lag-time 500");
        apply_cmd(&config, "lag", "lag-jitter 30");

        let snap = config.snapshot();
        assert!(snap.enabled);
        assert!(!snap.inbound);
        assert_eq!(snap.delay_ms, 500);
        assert_eq!(snap.jitter_ms, 30);
    }

    #[test]
    fn apply_cmd_ignores_invalid_input() {
        let config = LagConfig::new();

        apply_cmd(&config, "lag", "lag-time 99999");
        apply_cmd(&config, "lag", "lag-jitter abc");
        apply_cmd(&config, "lag", "lagx on");
        apply_cmd(&config, "lag", "drop on");
        apply_cmd(&config, "lag", "lag-time");
        apply_cmd(&config, "lag", "status");
        apply_cmd(&config, "lag", "");

        assert_eq!(config.snapshot(), LagConfig::new().snapshot());
    }
}
