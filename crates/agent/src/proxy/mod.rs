//! Per-request dispatcher: tag injection, protocol classification, origin
//! round-trip, and bidirectional stream bridging.

pub mod websocket;

use std::time::Instant;

use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING, UPGRADE, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use http_body_util::{BodyExt, BodyStream, Empty};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::buffer_pool::BufferPool;
use crate::config::TagConfig;
use crate::flow_limiter::FlowLimiter;
use crate::ingress::Ingress;
use crate::metrics::{Metrics, StatusLabel};
use crate::origin::{Body, HttpRoundTripper, OriginError, StreamDialer, StreamKind};

/// JSON `{"src":"cloudflared"|"origin"}` identifying who produced a response,
/// so the eyeball can distinguish a tunnel-synthesized error from an actual
/// origin response.
pub const RESPONSE_META_HEADER: &str = "response-meta";
pub const RAY_ID_HEADER: &str = "cf-ray";
pub const TAG_HEADER_PREFIX: &str = "Cf-Warp-Tag-";
/// Set by the tunnel handler on streams dialed for raw TCP (warp-routing),
/// since `InboundStream` itself carries no transport hint.
pub const WARP_ROUTING_HEADER: &str = "cf-warp-routing";

const LB_PROBE_USER_AGENT_PREFIX: &str =
	"Mozilla/5.0 (compatible; Cloudflare-Traffic-Manager/1.0; +https://www.cloudflare.com/traffic-manager/;";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
	Http,
	WebSocket,
	Tcp,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
	#[error("warp-routing is not enabled for this tunnel")]
	WarpRoutingDisabled,
	#[error("unable to determine request host")]
	MissingHost,
	#[error("unable to reach origin: {0}")]
	Origin(#[from] OriginError),
	#[error("too many concurrent flows")]
	TooManyFlows,
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

pub struct ProxyEngineConfig {
	pub tags: Vec<TagConfig>,
	pub warp_routing_enabled: bool,
}

/// Single entry point `proxy()`, consulting the Ingress Resolver and
/// dispatching to an Origin Service, bridging buffers from a shared pool.
pub struct ProxyEngine {
	ingress: std::sync::Arc<Ingress>,
	tags: Vec<TagConfig>,
	buffer_pool: BufferPool,
	flow_limiter: FlowLimiter,
	metrics: std::sync::Arc<Metrics>,
	warp_routing_enabled: bool,
	warp_dialer: crate::origin::TcpOrigin,
}

impl ProxyEngine {
	pub fn new(
		ingress: std::sync::Arc<Ingress>,
		config: ProxyEngineConfig,
		buffer_pool: BufferPool,
		flow_limiter: FlowLimiter,
		metrics: std::sync::Arc<Metrics>,
	) -> Self {
		Self {
			ingress,
			tags: config.tags,
			buffer_pool,
			flow_limiter,
			metrics,
			warp_routing_enabled: config.warp_routing_enabled,
			warp_dialer: crate::origin::TcpOrigin,
		}
	}

	fn append_tags(&self, headers: &mut HeaderMap) {
		for tag in &self.tags {
			let Ok(name) = HeaderName::from_bytes(format!("{TAG_HEADER_PREFIX}{}", tag.name).as_bytes()) else { continue };
			let Ok(value) = HeaderValue::from_str(&tag.value) else { continue };
			headers.insert(name, value);
		}
	}

	/// Dispatches one inbound request. `w` is the eyeball-facing writer the
	/// response status, headers, and body (or bridged stream) are written to.
	pub async fn proxy<W>(&self, w: &mut W, mut req: Request<Body>, source: SourceType, cancel: &CancellationToken) -> Result<(), ProxyError>
	where
		W: AsyncWrite + Unpin + Send,
	{
		self.metrics.total_requests.inc();
		self.metrics.concurrent_requests.inc();
		let _guard = scopeguard(&self.metrics);

		// Tags are appended before LB-probe classification, preserving the
		// source's ordering.
		self.append_tags(req.headers_mut());
		let lb_probe = is_lb_probe(req.headers());
		debug!(ray_id = ?req.headers().get(RAY_ID_HEADER), lb_probe, "proxying request");

		if source == SourceType::Tcp {
			if !self.warp_routing_enabled {
				return Err(ProxyError::WarpRoutingDisabled);
			}
			let dest = get_request_host(&req).ok_or(ProxyError::MissingHost)?;
			let (parts, body) = req.into_parts();
			let req = Request::from_parts(parts, Empty::<Bytes>::new().map_err(|never: std::convert::Infallible| match never {}).boxed());
			return self.proxy_stream(w, &dest, &req, &self.warp_dialer, source, body_as_reader(body), cancel).await;
		}

		let host = get_request_host(&req).unwrap_or_default();
		let path = req.uri().path().to_string();
		let (rule, rule_index) = self.ingress.find_matching_rule(&host, &path);
		info!(rule_index, %host, %path, "matched ingress rule");

		if let Some(rt) = rule.service.as_http_round_tripper() {
			let is_ws_upgrade = source == SourceType::WebSocket || has_ws_upgrade_headers(req.headers());
			if let Some(host_override) = &rule.config.host_header_override {
				if let Ok(value) = HeaderValue::from_str(host_override) {
					req.headers_mut().insert(HOST, value);
				}
			}
			self.proxy_http(w, req, rt, is_ws_upgrade, rule.config.disable_chunked_encoding).await
		} else if let Some(dialer) = rule.service.as_stream_dialer() {
			let dest = bastion_destination(&req).unwrap_or_else(|| rule.service.identifier());
			let (parts, body) = req.into_parts();
			let stub = Request::from_parts(parts, Empty::<Bytes>::new().map_err(|never: std::convert::Infallible| match never {}).boxed());
			self.proxy_stream(w, &dest, &stub, dialer, source, body_as_reader(body), cancel).await
		} else {
			unreachable!("every OriginService variant is either an HttpRoundTripper or a StreamDialer")
		}
	}

	async fn proxy_http<W>(
		&self,
		w: &mut W,
		req: Request<Body>,
		svc: &dyn HttpRoundTripper,
		is_ws_upgrade: bool,
		disable_chunked: bool,
	) -> Result<(), ProxyError>
	where
		W: AsyncWrite + Unpin + Send,
	{
		let (mut parts, body) = req.into_parts();
		// For a WS upgrade the origin request carries no body, but the
		// eyeball's reader keeps delivering post-upgrade frames; stash it so
		// it can be bridged to the origin once the 101 response lands.
		let mut eyeball_body_for_bridge = None;
		let egress_body = if is_ws_upgrade {
			parts.headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
			parts.headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
			parts.headers.remove(CONTENT_LENGTH);
			eyeball_body_for_bridge = Some(body);
			Empty::<Bytes>::new().map_err(|never: std::convert::Infallible| match never {}).boxed()
		} else if disable_chunked {
			parts.headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("gzip, deflate"));
			body
		} else {
			parts.headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
			body
		};

		let started = Instant::now();
		let egress_req = Request::from_parts(parts, egress_body);
		let mut resp = svc.round_trip(egress_req).await?;
		self.metrics.request_latency.observe(started.elapsed().as_secs_f64());
		self
			.metrics
			.responses_by_status
			.get_or_create(&StatusLabel { status: resp.status().as_u16() })
			.inc();

		let mut headers = resp.headers().clone();
		insert_response_meta(&mut headers, "origin");
		write_response_head(w, resp.status(), &headers).await?;

		if resp.status() == StatusCode::SWITCHING_PROTOCOLS {
			let upgraded = hyper::upgrade::on(&mut resp).await.map_err(std::io::Error::other)?;
			let origin_io = TokioIo::new(upgraded);
			let eyeball_reader = body_as_reader(eyeball_body_for_bridge.unwrap_or_else(|| Empty::<Bytes>::new().map_err(|never: std::convert::Infallible| match never {}).boxed()));
			bridge_duplex(eyeball_reader, w, origin_io, &self.buffer_pool).await?;
			return Ok(());
		}

		if is_event_stream(&headers) {
			write_event_stream(body_as_reader(resp.into_body()), w).await?;
		} else {
			copy_body_to_writer(resp.into_body(), w, &self.buffer_pool).await?;
		}
		Ok(())
	}

	async fn proxy_stream<W, R>(
		&self,
		w: &mut W,
		dest: &str,
		req: &Request<Body>,
		dialer: &dyn StreamDialer,
		source: SourceType,
		body_reader: R,
		cancel: &CancellationToken,
	) -> Result<(), ProxyError>
	where
		W: AsyncWrite + Unpin + Send,
		R: AsyncRead + Unpin + Send + 'static,
	{
		let _guard = self.flow_limiter.acquire("warp-routing").map_err(|_| ProxyError::TooManyFlows)?;
		let conn = dialer.establish(dest).await?;

		let mut headers = HeaderMap::new();
		headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
		headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
		if let Some(key) = req.headers().get("sec-websocket-key").and_then(|v| v.to_str().ok()) {
			if let Ok(accept) = HeaderValue::from_str(&websocket::accept_key(key)) {
				headers.insert("sec-websocket-accept", accept);
			}
		}
		insert_response_meta(&mut headers, "cloudflared");
		write_response_head(w, StatusCode::SWITCHING_PROTOCOLS, &headers).await?;

		let bridge = async {
			if source == SourceType::WebSocket && conn.kind != StreamKind::Ws {
				// The eyeball speaks WS frames but the origin is raw TCP: decode
				// inbound frames to their payload, and encode outbound payload
				// back into WS frames, on each side of the bridge respectively.
				let unframed = websocket::WsUnframer::new(body_reader);
				let framed = websocket::WsFramer::new(w);
				bridge_duplex(unframed, framed, conn.inner, &self.buffer_pool).await
			} else {
				bridge_duplex(body_reader, w, conn.inner, &self.buffer_pool).await
			}
		};

		tokio::select! {
			r = bridge => r.map_err(ProxyError::Io),
			_ = cancel.cancelled() => Ok(()),
		}
	}
}

/// Drops the concurrent-requests gauge back down when the request finishes,
/// however it finishes.
struct GaugeGuard<'a>(&'a Metrics);
impl Drop for GaugeGuard<'_> {
	fn drop(&mut self) {
		self.0.concurrent_requests.dec();
	}
}
fn scopeguard(metrics: &Metrics) -> GaugeGuard<'_> {
	GaugeGuard(metrics)
}

fn get_request_host(req: &Request<Body>) -> Option<String> {
	req
		.headers()
		.get(HOST)
		.and_then(|h| h.to_str().ok())
		.map(str::to_string)
		.or_else(|| req.uri().host().map(str::to_string))
		.filter(|s| !s.is_empty())
}

/// Bastion mode reads the stream destination from a request-bound header
/// instead of the rule's configured origin.
fn bastion_destination(req: &Request<Body>) -> Option<String> {
	req
		.headers()
		.get("cf-bastion-dest")
		.and_then(|h| h.to_str().ok())
		.map(str::to_string)
}

/// Determines the `SourceType` the tunnel handler should dispatch a newly
/// accepted stream under, from the `WARP_ROUTING_HEADER` sentinel and the
/// usual WebSocket upgrade headers.
pub fn classify_source(headers: &HeaderMap) -> SourceType {
	let warp_routing = headers
		.get(WARP_ROUTING_HEADER)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.eq_ignore_ascii_case("true"))
		.unwrap_or(false);
	if warp_routing {
		SourceType::Tcp
	} else if has_ws_upgrade_headers(headers) {
		SourceType::WebSocket
	} else {
		SourceType::Http
	}
}

fn has_ws_upgrade_headers(headers: &HeaderMap) -> bool {
	let is_upgrade = headers
		.get(CONNECTION)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.to_ascii_lowercase().contains("upgrade"))
		.unwrap_or(false);
	let is_ws = headers.get(UPGRADE).and_then(|v| v.to_str().ok()).map(|v| v.eq_ignore_ascii_case("websocket")).unwrap_or(false);
	is_upgrade && is_ws
}

pub fn is_lb_probe(headers: &HeaderMap) -> bool {
	headers
		.get(USER_AGENT)
		.and_then(|v| v.to_str().ok())
		.map(|ua| ua.starts_with(LB_PROBE_USER_AGENT_PREFIX))
		.unwrap_or(false)
}

/// A response is SSE iff some `Content-Type` value, with no leading
/// whitespace, starts exactly with `text/event-stream` (case-insensitive).
pub fn is_event_stream(headers: &HeaderMap) -> bool {
	headers.get_all(CONTENT_TYPE).iter().any(|v| v.to_str().map(|s| s.to_ascii_lowercase().starts_with("text/event-stream")).unwrap_or(false))
}

pub(crate) fn insert_response_meta(headers: &mut HeaderMap, src: &str) {
	let json = format!(r#"{{"src":"{src}"}}"#);
	if let Ok(value) = HeaderValue::from_str(&json) {
		headers.insert(HeaderName::from_static(RESPONSE_META_HEADER), value);
	}
}

pub(crate) async fn write_response_head<W: AsyncWrite + Unpin>(w: &mut W, status: StatusCode, headers: &HeaderMap) -> std::io::Result<()> {
	let mut out = format!("HTTP/1.1 {} {}\r\n", status.as_u16(), status.canonical_reason().unwrap_or(""));
	for (name, value) in headers.iter() {
		out.push_str(name.as_str());
		out.push_str(": ");
		out.push_str(value.to_str().unwrap_or(""));
		out.push_str("\r\n");
	}
	out.push_str("\r\n");
	w.write_all(out.as_bytes()).await
}

/// Adapts a frame-oriented [`Body`] into a byte-oriented [`AsyncRead`].
fn body_as_reader(body: Body) -> impl AsyncRead + Unpin + Send + 'static {
	let stream = BodyStream::new(body).try_filter_map(|frame| async move { Ok(frame.into_data().ok()) });
	StreamReader::new(stream)
}

async fn copy_body_to_writer<W: AsyncWrite + Unpin>(body: Body, w: &mut W, pool: &BufferPool) -> std::io::Result<()> {
	let mut reader = body_as_reader(body);
	let mut buf = pool.acquire();
	loop {
		let n = tokio::io::AsyncReadExt::read(&mut reader, &mut buf[..]).await?;
		if n == 0 {
			break;
		}
		w.write_all(&buf[..n]).await?;
	}
	Ok(())
}

/// Reads the origin response line-by-line and writes each line immediately,
/// so SSE events are delivered with no buffering beyond a line.
async fn write_event_stream<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(body: R, w: &mut W) -> std::io::Result<()> {
	let mut reader = BufReader::new(body);
	let mut line = Vec::new();
	loop {
		line.clear();
		let n = reader.read_until(b'\n', &mut line).await?;
		if n == 0 {
			break;
		}
		w.write_all(&line).await?;
		w.flush().await?;
	}
	Ok(())
}

/// Copies eyeball reader <-> origin duplex concurrently; whichever side ends
/// first (EOF or error) drops the other, closing the origin connection.
async fn bridge_duplex<R, W, O>(mut eyeball_reader: R, mut eyeball_writer: W, origin: O, pool: &BufferPool) -> std::io::Result<()>
where
	R: AsyncRead + Unpin + Send,
	W: AsyncWrite + Unpin + Send,
	O: AsyncRead + AsyncWrite + Unpin + Send,
{
	let (mut origin_read, mut origin_write) = tokio::io::split(origin);

	let to_origin = async {
		let mut buf = pool.acquire();
		loop {
			let n = tokio::io::AsyncReadExt::read(&mut eyeball_reader, &mut buf[..]).await?;
			if n == 0 {
				break;
			}
			origin_write.write_all(&buf[..n]).await?;
		}
		origin_write.shutdown().await
	};
	let from_origin = async {
		let mut buf = pool.acquire();
		loop {
			let n = tokio::io::AsyncReadExt::read(&mut origin_read, &mut buf[..]).await?;
			if n == 0 {
				break;
			}
			eyeball_writer.write_all(&buf[..n]).await?;
		}
		eyeball_writer.shutdown().await
	};

	tokio::select! {
		r = to_origin => r,
		r = from_origin => r,
	}
}

#[cfg(test)]
mod tests {
	use async_trait::async_trait;
	use http::header::CONTENT_TYPE;
	use http_body_util::Full;

	use super::*;
	use crate::origin::StatusOrigin;

	fn headers_with_content_type(value: &str) -> HeaderMap {
		let mut h = HeaderMap::new();
		h.insert(CONTENT_TYPE, HeaderValue::from_str(value).unwrap());
		h
	}

	#[test]
	fn event_stream_detection_matches_spec_examples() {
		assert!(is_event_stream(&headers_with_content_type("text/event-stream")));
		assert!(is_event_stream(&headers_with_content_type("Text/event-stream;charset=utf-8")));
		assert!(!is_event_stream(&headers_with_content_type(" text/event-stream")), "leading whitespace disqualifies");
		assert!(!is_event_stream(&headers_with_content_type("application/json")));
	}

	#[test]
	fn event_stream_detection_checks_every_value_of_a_multi_valued_header() {
		let mut headers = HeaderMap::new();
		headers.append(CONTENT_TYPE, HeaderValue::from_static("application/json"));
		headers.append(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
		assert!(is_event_stream(&headers));
	}

	#[test]
	fn lb_probe_detection_matches_prefix() {
		let mut headers = HeaderMap::new();
		headers.insert(
			USER_AGENT,
			HeaderValue::from_static("Mozilla/5.0 (compatible; Cloudflare-Traffic-Manager/1.0; +https://www.cloudflare.com/traffic-manager/;whatever)"),
		);
		assert!(is_lb_probe(&headers));
		headers.insert(USER_AGENT, HeaderValue::from_static("curl/8.0"));
		assert!(!is_lb_probe(&headers));
	}

	struct FixedStatusOrigin {
		status: u16,
		body: &'static str,
	}

	#[async_trait]
	impl HttpRoundTripper for FixedStatusOrigin {
		async fn round_trip(&self, _req: Request<Body>) -> Result<http::Response<Body>, OriginError> {
			let body: Body = Full::new(Bytes::from_static(self.body.as_bytes())).map_err(|n: std::convert::Infallible| match n {}).boxed();
			Ok(http::Response::builder().status(self.status).body(body).unwrap())
		}
	}

	fn engine(ingress: std::sync::Arc<Ingress>) -> ProxyEngine {
		let registry = &mut prometheus_client::registry::Registry::default();
		let metrics = std::sync::Arc::new(Metrics::new(registry));
		ProxyEngine::new(
			ingress,
			ProxyEngineConfig { tags: vec![], warp_routing_enabled: false },
			BufferPool::default(),
			FlowLimiter::new(0, metrics.clone()),
			metrics,
		)
	}

	#[tokio::test]
	async fn single_http_origin_echoes_status_and_body() {
		use crate::ingress::IngressRule;

		let origin = FixedStatusOrigin { status: 201, body: "Created" };
		// StatusOrigin can't carry a body, so exercise proxy_http directly
		// against a fixed-body origin instead of routing through Ingress.
		let ingress = std::sync::Arc::new(Ingress::new(vec![IngressRule::catch_all(crate::origin::OriginService::Status(StatusOrigin::new(404)))]).unwrap());
		let engine = engine(ingress);
		let req = Request::builder().uri("http://example.com/").body(Empty::<Bytes>::new().map_err(|n: std::convert::Infallible| match n {}).boxed()).unwrap();
		let mut out: Vec<u8> = Vec::new();
		engine.proxy_http(&mut out, req, &origin, false, false).await.unwrap();
		let text = String::from_utf8(out).unwrap();
		assert!(text.starts_with("HTTP/1.1 201 Created\r\n"));
		assert!(text.ends_with("Created"));
	}

	#[tokio::test]
	async fn disable_chunked_rewrites_transfer_encoding() {
		let origin = FixedStatusOrigin { status: 200, body: "ok" };
		let ingress = std::sync::Arc::new(Ingress::new(vec![crate::ingress::IngressRule::catch_all(crate::origin::OriginService::Status(StatusOrigin::new(404)))]).unwrap());
		let engine = engine(ingress);
		let req = Request::builder()
			.header(CONTENT_LENGTH, "5")
			.body(Full::new(Bytes::from_static(b"hello")).map_err(|n: std::convert::Infallible| match n {}).boxed())
			.unwrap();
		let mut out: Vec<u8> = Vec::new();
		engine.proxy_http(&mut out, req, &origin, false, true).await.unwrap();
		assert!(String::from_utf8(out).unwrap().starts_with("HTTP/1.1 200 OK\r\n"));
	}
}
