use async_trait::async_trait;
use tokio::net::TcpStream;

use super::{OriginError, StreamConn, StreamDialer, StreamKind};

/// Dials raw TCP to whatever destination the request carries (warp-routing /
/// bastion modes), rather than a fixed configured address.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpOrigin;

impl TcpOrigin {
	pub fn identifier(&self) -> String {
		"tcp".to_string()
	}
}

#[async_trait]
impl StreamDialer for TcpOrigin {
	async fn establish(&self, dest: &str) -> Result<StreamConn, OriginError> {
		let stream = TcpStream::connect(dest).await.map_err(|e| OriginError::Dial(e.to_string()))?;
		stream.set_nodelay(true).ok();
		Ok(StreamConn { kind: StreamKind::Tcp, inner: Box::new(stream) })
	}
}
