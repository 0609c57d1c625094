//! Process-wide metrics aggregate. Built once at startup and threaded (via
//! `Arc`) into every component that reports a counter or gauge. The HTTP
//! endpoint that serves these out of the registry is out of scope here.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct ConnIndexLabel {
	pub conn_index: u32,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabel {
	pub status: u16,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct FlowLabel {
	pub label: String,
}

#[derive(Clone, Hash, Default, Debug, PartialEq, Eq, EncodeLabelSet)]
pub struct RpcOpLabel {
	pub op: String,
}

#[derive(Debug)]
pub struct Metrics {
	pub ha_connections: Gauge,
	pub total_requests: Counter,
	pub concurrent_requests: Gauge,
	pub request_latency: Histogram,
	pub responses_by_status: Family<StatusLabel, Counter>,
	pub auth_successes: Counter,
	pub auth_failures: Counter,
	pub flow_drops: Family<FlowLabel, Counter>,
	pub rpc_ops: Family<RpcOpLabel, Counter>,
	pub rpc_failures: Family<RpcOpLabel, Counter>,
	pub tunnel_502s: Family<ConnIndexLabel, Counter>,
	pub tunnel_200s: Family<ConnIndexLabel, Counter>,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let mut build_counter = |name: &str, help: &str| {
			let m = Counter::default();
			registry.register(name, help, m.clone());
			m
		};
		let mut build_gauge = |name: &str, help: &str| {
			let m = Gauge::default();
			registry.register(name, help, m.clone());
			m
		};
		let mut build_family = |name: &str, help: &str| {
			let m = Family::default();
			registry.register(name, help, m.clone());
			m
		};

		let request_latency = Histogram::new(prometheus_client::metrics::histogram::exponential_buckets(0.001, 2.0, 16));
		registry.register("request_duration_seconds", "Origin round-trip latency", request_latency.clone());

		Metrics {
			ha_connections: build_gauge("ha_connections", "Number of established HA tunnel connections"),
			total_requests: build_counter("requests_total", "Total proxied requests"),
			concurrent_requests: build_gauge("requests_concurrent", "Requests currently in flight"),
			request_latency,
			responses_by_status: build_family("responses_by_status", "Proxied responses by origin status code"),
			auth_successes: build_counter("auth_successes_total", "Successful authentication attempts"),
			auth_failures: build_counter("auth_failures_total", "Failed authentication attempts"),
			flow_drops: build_family("flow_drops", "Flows rejected by the flow limiter, by label"),
			rpc_ops: build_family("rpc_ops_total", "RPC operations issued, by operation name"),
			rpc_failures: build_family("rpc_failures_total", "RPC operations that failed, by operation name"),
			tunnel_502s: build_family("tunnel_502_total", "502 responses served per connection index"),
			tunnel_200s: build_family("tunnel_200_total", "200 responses served per connection index"),
		}
	}
}

impl Default for Metrics {
	fn default() -> Self {
		Self::new(&mut Registry::default())
	}
}
