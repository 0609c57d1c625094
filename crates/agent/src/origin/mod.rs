//! Capability-polymorphic origin endpoints. A closed sum type, matched on
//! rather than dispatched through a trait object with runtime casts.

pub mod hello_world;
pub mod http;
pub mod status;
pub mod tcp;
pub mod ws;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::io::ReaderStream;

pub use hello_world::HelloWorldOrigin;
pub use http::HttpOrigin;
pub use status::StatusOrigin;
pub use tcp::TcpOrigin;
pub use ws::WsOrigin;

pub type Body = http_body_util::combinators::BoxBody<Bytes, std::io::Error>;

/// Adapts an `AsyncRead` (e.g. the reader half of an inbound stream) into a
/// [`Body`] for forwarding as an egress request/response body.
pub fn body_from_reader<R>(reader: R) -> Body
where
	R: AsyncRead + Send + 'static,
{
	let stream = ReaderStream::new(reader).map_ok(::http_body::Frame::data);
	StreamBody::new(stream).boxed()
}

#[derive(Debug, thiserror::Error)]
pub enum OriginError {
	#[error("unable to reach origin: {0}")]
	RoundTrip(String),
	#[error("unable to establish stream to origin: {0}")]
	Dial(String),
}

/// A full-duplex byte stream to a TCP or WebSocket origin.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
	Tcp,
	Ws,
}

pub struct StreamConn {
	pub kind: StreamKind,
	pub inner: Box<dyn Duplex>,
}

#[async_trait]
pub trait HttpRoundTripper: Send + Sync {
	async fn round_trip(&self, req: ::http::Request<Body>) -> Result<::http::Response<Body>, OriginError>;
}

#[async_trait]
pub trait StreamDialer: Send + Sync {
	async fn establish(&self, dest: &str) -> Result<StreamConn, OriginError>;
}

/// The closed set of origins the agent can dispatch to.
#[derive(Clone)]
pub enum OriginService {
	Http(HttpOrigin),
	Ws(WsOrigin),
	Tcp(TcpOrigin),
	Status(StatusOrigin),
	HelloWorld(HelloWorldOrigin),
}

impl std::fmt::Debug for OriginService {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.identifier())
	}
}

impl OriginService {
	pub fn identifier(&self) -> String {
		match self {
			OriginService::Http(o) => o.identifier(),
			OriginService::Ws(o) => o.identifier(),
			OriginService::Tcp(o) => o.identifier(),
			OriginService::Status(o) => o.identifier(),
			OriginService::HelloWorld(o) => o.identifier(),
		}
	}

	/// `rewriteOriginURL`: maps an inbound request path onto this origin's
	/// configured base, for HTTP-capable variants.
	pub fn rewrite_origin_url(&self, path_and_query: &str) -> Option<::http::Uri> {
		match self {
			OriginService::Http(o) => Some(o.rewrite_origin_url(path_and_query)),
			OriginService::Status(_) => None,
			OriginService::HelloWorld(o) => Some(o.rewrite_origin_url(path_and_query)),
			OriginService::Ws(_) | OriginService::Tcp(_) => None,
		}
	}

	pub fn as_http_round_tripper(&self) -> Option<&dyn HttpRoundTripper> {
		match self {
			OriginService::Http(o) => Some(o),
			OriginService::Status(o) => Some(o),
			OriginService::HelloWorld(o) => Some(o),
			OriginService::Ws(_) | OriginService::Tcp(_) => None,
		}
	}

	pub fn as_stream_dialer(&self) -> Option<&dyn StreamDialer> {
		match self {
			OriginService::Ws(o) => Some(o),
			OriginService::Tcp(o) => Some(o),
			OriginService::Http(_) | OriginService::Status(_) | OriginService::HelloWorld(_) => None,
		}
	}
}
