//! RFC 6455 accept-key computation, and a framer that encapsulates raw TCP
//! bytes as WebSocket frames when bridging a non-WS origin to a WS eyeball.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use websocket_sans_io::{Opcode, WebsocketFrameDecoder, WebsocketFrameEvent};

pub const WS_ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` per RFC 6455 §1.3: SHA-1 of the client key
/// concatenated with the magic GUID, base64-encoded.
pub fn accept_key(client_key: &str) -> String {
	let mut hasher = Sha1::new();
	hasher.update(client_key.as_bytes());
	hasher.update(WS_ACCEPT_GUID.as_bytes());
	BASE64.encode(hasher.finalize())
}

fn encode_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(payload.len() + 10);
	out.push(0x80 | (opcode as u8));
	let len = payload.len();
	if len < 126 {
		out.push(len as u8);
	} else if len <= u16::MAX as usize {
		out.push(126);
		out.extend_from_slice(&(len as u16).to_be_bytes());
	} else {
		out.push(127);
		out.extend_from_slice(&(len as u64).to_be_bytes());
	}
	out.extend_from_slice(payload);
	out
}

/// Wraps an eyeball-facing writer so bytes written to it are first
/// encapsulated in unmasked binary WS frames (server-to-client frames are
/// never masked per RFC 6455).
pub struct WsFramer<W> {
	inner: W,
}

impl<W> WsFramer<W> {
	pub fn new(inner: W) -> Self {
		Self { inner }
	}
}

impl<W: AsyncWrite + Unpin> AsyncWrite for WsFramer<W> {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
		let this = self.get_mut();
		let framed = encode_frame(Opcode::Binary, buf);
		match Pin::new(&mut this.inner).poll_write(cx, &framed) {
			Poll::Ready(Ok(_)) => Poll::Ready(Ok(buf.len())),
			Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
			Poll::Pending => Poll::Pending,
		}
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
		Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
	}
}

/// Wraps an eyeball-facing reader so inbound WS frames are decoded down to
/// their raw payload bytes before reaching a non-WS origin.
pub struct WsUnframer<R> {
	inner: R,
	decoder: WebsocketFrameDecoder,
	raw: BytesMut,
	out: BytesMut,
}

impl<R> WsUnframer<R> {
	pub fn new(inner: R) -> Self {
		Self {
			inner,
			decoder: WebsocketFrameDecoder::new(),
			raw: BytesMut::new(),
			out: BytesMut::new(),
		}
	}
}

impl<R: AsyncRead + Unpin> AsyncRead for WsUnframer<R> {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
		let this = self.get_mut();
		if !this.out.is_empty() {
			let n = std::cmp::min(buf.remaining(), this.out.len());
			buf.put_slice(&this.out[..n]);
			let _ = this.out.split_to(n);
			return Poll::Ready(Ok(()));
		}

		let mut tmp = [0u8; 4096];
		let mut read_buf = ReadBuf::new(&mut tmp);
		ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf)?);
		let n = read_buf.filled().len();
		if n == 0 {
			return Poll::Ready(Ok(()));
		}
		this.raw.extend_from_slice(&tmp[..n]);

		loop {
			let mut chunk = this.raw.to_vec();
			let Ok(ret) = this.decoder.add_data(&mut chunk) else {
				return Poll::Ready(Err(std::io::Error::other("invalid websocket frame")));
			};
			if ret.consumed_bytes == 0 && ret.event.is_none() {
				break;
			}
			let _ = this.raw.split_to(ret.consumed_bytes);
			match ret.event {
				Some(WebsocketFrameEvent::PayloadChunk { original_opcode: Opcode::Binary | Opcode::Text }) => {
					this.out.extend_from_slice(&chunk[..ret.consumed_bytes]);
				},
				Some(WebsocketFrameEvent::End { original_opcode: Opcode::Close, .. }) => {
					return Poll::Ready(Ok(()));
				},
				_ => {},
			}
			if this.raw.is_empty() {
				break;
			}
		}

		let n = std::cmp::min(buf.remaining(), this.out.len());
		buf.put_slice(&this.out[..n]);
		let _ = this.out.split_to(n);
		Poll::Ready(Ok(()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn accept_key_matches_rfc6455_example() {
		// RFC 6455 §1.3 worked example.
		assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
	}

	#[test]
	fn encode_frame_uses_fin_and_binary_opcode() {
		let framed = encode_frame(Opcode::Binary, b"hi");
		assert_eq!(framed[0], 0x82);
		assert_eq!(framed[1], 2);
		assert_eq!(&framed[2..], b"hi");
	}
}
