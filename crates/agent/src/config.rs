//! Typed, immutable per-process configuration. Parsing this from CLI flags or
//! a config file is out of scope here — callers build a `TunnelConfig`
//! directly and hand it to the supervisor.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ingress::Ingress;
use crate::metrics::Metrics;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Protocol {
	Http2,
	H2mux,
	Quic,
}

impl Default for Protocol {
	fn default() -> Self {
		Protocol::H2mux
	}
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolSelectorConfig {
	#[serde(default)]
	pub primary: Protocol,
	#[serde(default)]
	pub fallback: Option<Protocol>,
	/// Rollout percentage (0..100) consulted to decide the initial protocol
	/// when no fixed `primary` preference applies.
	#[serde(default)]
	pub percentage: Option<u8>,
}

/// Either a named-tunnel credential (modern, JWT-based) or a classic-tunnel
/// origin cert. Whichever is present drives how `Authenticate` is called.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthCredentials {
	NamedTunnel { tunnel_id: String, tunnel_secret: String, account_tag: String },
	ClassicTunnel { origin_cert: Vec<u8> },
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EdgeTlsConfig {
	#[serde(default)]
	pub insecure_skip_verify: bool,
	#[serde(default)]
	pub server_name_override: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TagConfig {
	pub name: String,
	pub value: String,
}

fn default_ha_connections() -> u32 {
	4
}

fn default_grace_period() -> Duration {
	Duration::from_secs(30)
}

fn default_heartbeat_interval() -> Duration {
	Duration::from_secs(5)
}

fn default_max_heartbeats() -> u32 {
	5
}

fn default_registration_interval() -> Duration {
	Duration::from_secs(1)
}

fn default_dial_timeout() -> Duration {
	Duration::from_secs(15)
}

fn default_open_stream_timeout() -> Duration {
	Duration::from_secs(30)
}

fn default_muxer_timeout() -> Duration {
	Duration::from_secs(5)
}

fn default_metrics_update_freq() -> Duration {
	Duration::from_secs(5)
}

fn default_buffer_size() -> usize {
	crate::buffer_pool::DEFAULT_BUFFER_SIZE
}

fn default_resolve_ttl() -> Duration {
	Duration::from_secs(300)
}

fn default_compression_quality() -> u8 {
	0
}

fn default_protocol_fallback_threshold() -> u32 {
	3
}

/// Immutable per-process policy, read-only after construction.
#[derive(Clone)]
pub struct TunnelConfig {
	pub ha_connections: u32,
	/// 0 disables the supervisor retry cap (retry forever).
	pub retries: u32,
	pub grace_period: Duration,
	pub heartbeat_interval: Duration,
	pub max_heartbeats: u32,
	pub registration_interval: Duration,
	pub dial_timeout: Duration,
	pub open_stream_timeout: Duration,
	pub muxer_timeout: Duration,
	pub metrics_update_freq: Duration,
	pub buffer_size: usize,
	pub resolve_ttl: Duration,
	pub compression_quality: u8,
	pub tags: Vec<TagConfig>,
	pub ingress: Arc<Ingress>,
	pub edge_tls: EdgeTlsConfig,
	pub protocol_selector: ProtocolSelectorConfig,
	/// Consecutive handshake/registration failures on a connection's current
	/// protocol before the supervisor switches that connection to fallback.
	pub protocol_fallback_threshold: u32,
	pub auth: AuthCredentials,
	pub use_reconnect_token: bool,
	pub warp_routing_enabled: bool,
	pub metrics: Arc<Metrics>,
}

impl TunnelConfig {
	pub fn builder(ingress: Arc<Ingress>, auth: AuthCredentials, metrics: Arc<Metrics>) -> TunnelConfigBuilder {
		TunnelConfigBuilder {
			ha_connections: default_ha_connections(),
			retries: 5,
			grace_period: default_grace_period(),
			heartbeat_interval: default_heartbeat_interval(),
			max_heartbeats: default_max_heartbeats(),
			registration_interval: default_registration_interval(),
			dial_timeout: default_dial_timeout(),
			open_stream_timeout: default_open_stream_timeout(),
			muxer_timeout: default_muxer_timeout(),
			metrics_update_freq: default_metrics_update_freq(),
			buffer_size: default_buffer_size(),
			resolve_ttl: default_resolve_ttl(),
			compression_quality: default_compression_quality(),
			tags: Vec::new(),
			ingress,
			edge_tls: EdgeTlsConfig::default(),
			protocol_selector: ProtocolSelectorConfig::default(),
			protocol_fallback_threshold: default_protocol_fallback_threshold(),
			auth,
			use_reconnect_token: true,
			warp_routing_enabled: false,
			metrics,
		}
	}
}

/// Builder so optional fields don't need to be respecified by every caller;
/// mirrors the `RawConfig` → `Config` defaulting pattern without a parser.
pub struct TunnelConfigBuilder {
	ha_connections: u32,
	retries: u32,
	grace_period: Duration,
	heartbeat_interval: Duration,
	max_heartbeats: u32,
	registration_interval: Duration,
	dial_timeout: Duration,
	open_stream_timeout: Duration,
	muxer_timeout: Duration,
	metrics_update_freq: Duration,
	buffer_size: usize,
	resolve_ttl: Duration,
	compression_quality: u8,
	tags: Vec<TagConfig>,
	ingress: Arc<Ingress>,
	edge_tls: EdgeTlsConfig,
	protocol_selector: ProtocolSelectorConfig,
	protocol_fallback_threshold: u32,
	auth: AuthCredentials,
	use_reconnect_token: bool,
	warp_routing_enabled: bool,
	metrics: Arc<Metrics>,
}

macro_rules! setter {
	($field:ident, $ty:ty) => {
		pub fn $field(mut self, value: $ty) -> Self {
			self.$field = value;
			self
		}
	};
}

impl TunnelConfigBuilder {
	setter!(ha_connections, u32);
	setter!(retries, u32);
	setter!(grace_period, Duration);
	setter!(tags, Vec<TagConfig>);
	setter!(edge_tls, EdgeTlsConfig);
	setter!(protocol_selector, ProtocolSelectorConfig);
	setter!(protocol_fallback_threshold, u32);
	setter!(use_reconnect_token, bool);
	setter!(warp_routing_enabled, bool);
	setter!(compression_quality, u8);

	pub fn build(self) -> TunnelConfig {
		TunnelConfig {
			ha_connections: self.ha_connections,
			retries: self.retries,
			grace_period: self.grace_period,
			heartbeat_interval: self.heartbeat_interval,
			max_heartbeats: self.max_heartbeats,
			registration_interval: self.registration_interval,
			dial_timeout: self.dial_timeout,
			open_stream_timeout: self.open_stream_timeout,
			muxer_timeout: self.muxer_timeout,
			metrics_update_freq: self.metrics_update_freq,
			buffer_size: self.buffer_size,
			resolve_ttl: self.resolve_ttl,
			compression_quality: self.compression_quality,
			tags: self.tags,
			ingress: self.ingress,
			edge_tls: self.edge_tls,
			protocol_selector: self.protocol_selector,
			protocol_fallback_threshold: self.protocol_fallback_threshold,
			auth: self.auth,
			use_reconnect_token: self.use_reconnect_token,
			warp_routing_enabled: self.warp_routing_enabled,
			metrics: self.metrics,
		}
	}
}
