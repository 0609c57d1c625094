use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{OriginError, StreamConn, StreamDialer, StreamKind};
use crate::proxy::websocket::accept_key;

/// Dials a WebSocket endpoint; the stream returned is already past the
/// upgrade handshake, so bytes flow through unmodified.
#[derive(Debug, Clone)]
pub struct WsOrigin {
	pub authority: String,
	pub path: String,
}

impl WsOrigin {
	pub fn new(authority: impl Into<String>, path: impl Into<String>) -> Self {
		Self { authority: authority.into(), path: path.into() }
	}

	pub fn identifier(&self) -> String {
		format!("ws://{}{}", self.authority, self.path)
	}
}

#[async_trait]
impl StreamDialer for WsOrigin {
	async fn establish(&self, _dest: &str) -> Result<StreamConn, OriginError> {
		let mut stream = TcpStream::connect(&self.authority).await.map_err(|e| OriginError::Dial(e.to_string()))?;
		stream.set_nodelay(true).ok();

		let key_bytes = uuid::Uuid::new_v4();
		let key = BASE64.encode(key_bytes.as_bytes());
		let request = format!(
			"GET {path} HTTP/1.1\r\n\
			 Host: {host}\r\n\
			 Upgrade: websocket\r\n\
			 Connection: Upgrade\r\n\
			 Sec-WebSocket-Key: {key}\r\n\
			 Sec-WebSocket-Version: 13\r\n\
			 \r\n",
			path = self.path,
			host = self.authority,
		);
		stream.write_all(request.as_bytes()).await.map_err(|e| OriginError::Dial(e.to_string()))?;

		let mut buf = [0u8; 4096];
		let mut pos = 0;
		loop {
			let n = stream.read(&mut buf[pos..]).await.map_err(|e| OriginError::Dial(e.to_string()))?;
			if n == 0 {
				return Err(OriginError::Dial("origin closed during ws handshake".into()));
			}
			pos += n;
			let received = String::from_utf8_lossy(&buf[..pos]);
			if let Some(end) = received.find("\r\n\r\n") {
				if !received.starts_with("HTTP/1.1 101") {
					return Err(OriginError::Dial(format!("origin rejected ws upgrade: {received}")));
				}
				let expected = accept_key(&key);
				let accepted = received[..end].lines().any(|line| {
					line.to_ascii_lowercase().starts_with("sec-websocket-accept:") && line.ends_with(expected.as_str())
				});
				if !accepted {
					return Err(OriginError::Dial("origin sent mismatched Sec-WebSocket-Accept".into()));
				}
				break;
			}
			if pos == buf.len() {
				return Err(OriginError::Dial("ws handshake headers too long".into()));
			}
		}

		Ok(StreamConn { kind: StreamKind::Ws, inner: Box::new(stream) })
	}
}
