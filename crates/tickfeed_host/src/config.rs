#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tickfeed_client::{ClientConfig, HttpResolverConfig};
use tracing::{info, warn};

pub const DEFAULT_TICK_HZ: u32 = 20;

/// Default config path: `~/.tickfeed/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".tickfeed").join("config.toml"))
}

/// Load the host config from TOML and env overrides.
pub fn load_host_config_from_path(path: &Path) -> anyhow::Result<HostConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = HostConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
	/// Channel URL or bare channel id.
	pub source_url: String,
	/// Connect as soon as the host starts.
	pub auto_connect: bool,
	pub reconnect_enabled: bool,
	pub tick_hz: u32,
	/// Per-tick event budget override.
	pub tick_budget: Option<usize>,
	/// Chat websocket URL override; may contain `{shard}`.
	pub ws_url: Option<String>,
	pub api_base_url: Option<String>,
	pub chat_api_base_url: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

impl Default for HostConfig {
	fn default() -> Self {
		Self {
			source_url: String::new(),
			auto_connect: false,
			reconnect_enabled: true,
			tick_hz: DEFAULT_TICK_HZ,
			tick_budget: None,
			ws_url: None,
			api_base_url: None,
			chat_api_base_url: None,
			metrics_bind: None,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	source_url: Option<String>,
	auto_connect: Option<bool>,
	reconnect_enabled: Option<bool>,

	#[serde(default)]
	host: FileHostSettings,

	#[serde(default)]
	endpoints: FileEndpointSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileHostSettings {
	tick_hz: Option<u32>,
	tick_budget: Option<usize>,
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileEndpointSettings {
	ws_url: Option<String>,
	api_base_url: Option<String>,
	chat_api_base_url: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl HostConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = Self::default();
		Self {
			source_url: non_empty(file.source_url).unwrap_or_default(),
			auto_connect: file.auto_connect.unwrap_or(defaults.auto_connect),
			reconnect_enabled: file.reconnect_enabled.unwrap_or(defaults.reconnect_enabled),
			tick_hz: file.host.tick_hz.unwrap_or(defaults.tick_hz),
			tick_budget: file.host.tick_budget,
			ws_url: non_empty(file.endpoints.ws_url),
			api_base_url: non_empty(file.endpoints.api_base_url),
			chat_api_base_url: non_empty(file.endpoints.chat_api_base_url),
			metrics_bind: non_empty(file.host.metrics_bind),
		}
	}

	pub fn client_config(&self) -> ClientConfig {
		let mut cfg = ClientConfig::default();
		if let Some(url) = &self.ws_url {
			cfg.ws_url = url.clone();
		}
		if let Some(budget) = self.tick_budget {
			cfg.tick_budget = budget;
		}
		cfg
	}

	pub fn resolver_config(&self) -> HttpResolverConfig {
		let mut cfg = HttpResolverConfig::default();
		if let Some(base) = &self.api_base_url {
			cfg.api_base_url = base.clone();
		}
		if let Some(base) = &self.chat_api_base_url {
			cfg.chat_api_base_url = base.clone();
		}
		cfg
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut HostConfig, env: impl Fn(&str) -> Option<String>) {
	let text = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = text("TICKFEED_SOURCE_URL") {
		cfg.source_url = v;
		info!("host config: source_url overridden by env");
	}

	if let Some(v) = env("TICKFEED_AUTO_CONNECT")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.auto_connect = enabled;
		info!(enabled, "host config: auto_connect overridden by env");
	}

	if let Some(v) = env("TICKFEED_RECONNECT_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.reconnect_enabled = enabled;
		info!(enabled, "host config: reconnect_enabled overridden by env");
	}

	if let Some(v) = env("TICKFEED_TICK_HZ")
		&& let Ok(hz) = v.trim().parse::<u32>()
	{
		cfg.tick_hz = hz;
		info!(hz, "host config: tick_hz overridden by env");
	}

	if let Some(v) = env("TICKFEED_TICK_BUDGET")
		&& let Ok(budget) = v.trim().parse::<usize>()
	{
		cfg.tick_budget = Some(budget);
		info!(budget, "host config: tick_budget overridden by env");
	}

	if let Some(v) = text("TICKFEED_WS_URL") {
		cfg.ws_url = Some(v);
		info!("host config: ws_url overridden by env");
	}

	if let Some(v) = text("TICKFEED_API_BASE_URL") {
		cfg.api_base_url = Some(v);
		info!("host config: api_base_url overridden by env");
	}

	if let Some(v) = text("TICKFEED_CHAT_API_BASE_URL") {
		cfg.chat_api_base_url = Some(v);
		info!("host config: chat_api_base_url overridden by env");
	}

	if let Some(v) = text("TICKFEED_METRICS_BIND") {
		cfg.metrics_bind = Some(v);
		info!("host config: metrics_bind overridden by env");
	}

	if cfg.tick_hz == 0 {
		warn!("host config: tick_hz must be positive; using {DEFAULT_TICK_HZ}");
		cfg.tick_hz = DEFAULT_TICK_HZ;
	}

	if cfg.tick_budget == Some(0) {
		warn!("host config: tick_budget of 0 would never drain; using the client default");
		cfg.tick_budget = None;
	}

	if cfg.auto_connect && cfg.source_url.is_empty() {
		warn!("host config: auto_connect set but no source_url configured");
	}
}
