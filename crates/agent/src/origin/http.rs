use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::Connected;
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::TlsConnector;
use tower_service::Service;

use super::{Body, HttpRoundTripper, OriginError};

#[derive(Debug, Clone)]
pub struct HttpOriginConfig {
	/// Base origin URL. `unix:///path/to.sock` dials a local socket instead of
	/// TCP/TLS.
	pub url: ::http::Uri,
	pub tls_config: Option<Arc<rustls::ClientConfig>>,
	pub server_name_override: Option<String>,
	pub connect_timeout: Duration,
	pub disable_chunked_encoding: bool,
}

impl Default for HttpOriginConfig {
	fn default() -> Self {
		Self {
			url: ::http::Uri::from_static("http://127.0.0.1"),
			tls_config: None,
			server_name_override: None,
			connect_timeout: Duration::from_secs(10),
			disable_chunked_encoding: false,
		}
	}
}

#[derive(Clone)]
struct OriginConnector {
	config: HttpOriginConfig,
}

enum Dialed {
	Tcp(TokioIo<TcpStream>),
	Unix(TokioIo<UnixStream>),
	Tls(TokioIo<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl hyper::rt::Read for Dialed {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: hyper::rt::ReadBufCursor<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			Dialed::Tcp(s) => Pin::new(s).poll_read(cx, buf),
			Dialed::Unix(s) => Pin::new(s).poll_read(cx, buf),
			Dialed::Tls(s) => Pin::new(s).poll_read(cx, buf),
		}
	}
}

impl hyper::rt::Write for Dialed {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<std::io::Result<usize>> {
		match self.get_mut() {
			Dialed::Tcp(s) => Pin::new(s).poll_write(cx, data),
			Dialed::Unix(s) => Pin::new(s).poll_write(cx, data),
			Dialed::Tls(s) => Pin::new(s).poll_write(cx, data),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			Dialed::Tcp(s) => Pin::new(s).poll_flush(cx),
			Dialed::Unix(s) => Pin::new(s).poll_flush(cx),
			Dialed::Tls(s) => Pin::new(s).poll_flush(cx),
		}
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		match self.get_mut() {
			Dialed::Tcp(s) => Pin::new(s).poll_shutdown(cx),
			Dialed::Unix(s) => Pin::new(s).poll_shutdown(cx),
			Dialed::Tls(s) => Pin::new(s).poll_shutdown(cx),
		}
	}
}

impl hyper_util::client::legacy::connect::Connection for Dialed {
	fn connected(&self) -> Connected {
		Connected::new()
	}
}

impl Service<::http::Uri> for OriginConnector {
	type Response = Dialed;
	type Error = std::io::Error;
	type Future = Pin<Box<dyn Future<Output = Result<Dialed, std::io::Error>> + Send>>;

	fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
		Poll::Ready(Ok(()))
	}

	fn call(&mut self, uri: ::http::Uri) -> Self::Future {
		let config = self.config.clone();
		Box::pin(async move {
			if uri.scheme_str() == Some("unix") {
				let path = uri.path();
				let stream = UnixStream::connect(path).await?;
				return Ok(Dialed::Unix(TokioIo::new(stream)));
			}

			let host = uri.host().ok_or_else(|| std::io::Error::other("origin url missing host"))?;
			let port = uri.port_u16().unwrap_or(if uri.scheme_str() == Some("https") { 443 } else { 80 });
			let tcp = tokio::time::timeout(config.connect_timeout, TcpStream::connect((host, port)))
				.await
				.map_err(|_| std::io::Error::other("connect timed out"))??;
			tcp.set_nodelay(true).ok();

			if let Some(tls_config) = config.tls_config {
				let server_name_str = config.server_name_override.clone().unwrap_or_else(|| host.to_string());
				let name = ServerName::try_from(server_name_str)
					.map_err(|_| std::io::Error::other("invalid tls server name"))?
					.to_owned();
				let tls = TlsConnector::from(tls_config).connect(name, tcp).await?;
				Ok(Dialed::Tls(TokioIo::new(tls)))
			} else {
				Ok(Dialed::Tcp(TokioIo::new(tcp)))
			}
		})
	}
}

/// A pooled HTTP client origin. `unix://` URLs dial a local socket; everything
/// else dials TCP, optionally upgrading to TLS.
#[derive(Clone)]
pub struct HttpOrigin {
	config: HttpOriginConfig,
	client: Client<OriginConnector, Body>,
}

impl HttpOrigin {
	pub fn new(config: HttpOriginConfig) -> Self {
		let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(OriginConnector { config: config.clone() });
		Self { config, client }
	}

	pub fn identifier(&self) -> String {
		self.config.url.to_string()
	}

	pub fn rewrite_origin_url(&self, path_and_query: &str) -> ::http::Uri {
		let authority = self.config.url.authority().cloned();
		let scheme = self.config.url.scheme().cloned().unwrap_or(::http::uri::Scheme::HTTP);
		let mut builder = ::http::Uri::builder().scheme(scheme).path_and_query(path_and_query);
		if let Some(authority) = authority {
			builder = builder.authority(authority);
		}
		builder.build().unwrap_or_else(|_| self.config.url.clone())
	}
}

#[async_trait]
impl HttpRoundTripper for HttpOrigin {
	async fn round_trip(&self, req: ::http::Request<Body>) -> Result<::http::Response<Body>, OriginError> {
		let resp = self.client.request(req).await.map_err(|e| OriginError::RoundTrip(e.to_string()))?;
		Ok(resp.map(|b| b.map_err(std::io::Error::other).boxed()))
	}
}
