//! Reusable scratch buffers for stream-to-stream copying.

use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Larger than the 32 KiB a naive copy loop would use: per-stream compression
/// dictionaries accumulate on the first write, so a small buffer starves them.
pub const DEFAULT_BUFFER_SIZE: usize = 512 * 1024;

#[derive(Debug)]
struct Inner {
	buf_size: usize,
	free: Mutex<Vec<BytesMut>>,
}

/// Thread-safe pool of fixed-size buffers. `acquire` never blocks: it either
/// pops a previously released buffer or allocates a fresh one.
#[derive(Debug, Clone)]
pub struct BufferPool {
	inner: Arc<Inner>,
}

impl BufferPool {
	pub fn new(buf_size: usize) -> Self {
		Self {
			inner: Arc::new(Inner {
				buf_size,
				free: Mutex::new(Vec::new()),
			}),
		}
	}

	pub fn buf_size(&self) -> usize {
		self.inner.buf_size
	}

	pub fn acquire(&self) -> PooledBuffer {
		let buf = self
			.inner
			.free
			.lock()
			.pop()
			.unwrap_or_else(|| BytesMut::zeroed(self.inner.buf_size));
		PooledBuffer {
			buf: Some(buf),
			pool: self.clone(),
		}
	}

	fn release(&self, mut buf: BytesMut) {
		buf.clear();
		buf.resize(self.inner.buf_size, 0);
		self.inner.free.lock().push(buf);
	}
}

impl Default for BufferPool {
	fn default() -> Self {
		Self::new(DEFAULT_BUFFER_SIZE)
	}
}

/// A buffer checked out of a [`BufferPool`]. Returned to the pool on drop.
pub struct PooledBuffer {
	buf: Option<BytesMut>,
	pool: BufferPool,
}

impl std::ops::Deref for PooledBuffer {
	type Target = BytesMut;
	fn deref(&self) -> &BytesMut {
		self.buf.as_ref().expect("buffer taken only on drop")
	}
}

impl std::ops::DerefMut for PooledBuffer {
	fn deref_mut(&mut self) -> &mut BytesMut {
		self.buf.as_mut().expect("buffer taken only on drop")
	}
}

impl Drop for PooledBuffer {
	fn drop(&mut self) {
		if let Some(buf) = self.buf.take() {
			self.pool.release(buf);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn acquire_reuses_released_buffers() {
		let pool = BufferPool::new(1024);
		let ptr = {
			let buf = pool.acquire();
			buf.as_ptr()
		};
		let buf2 = pool.acquire();
		assert_eq!(buf2.as_ptr(), ptr, "released buffer should be reused, not reallocated");
	}

	#[test]
	fn acquire_never_blocks_when_empty() {
		let pool = BufferPool::new(64);
		let a = pool.acquire();
		let b = pool.acquire();
		assert_eq!(a.len(), 64);
		assert_eq!(b.len(), 64);
	}

	#[test]
	fn buffers_are_cleared_between_uses() {
		let pool = BufferPool::new(8);
		{
			let mut buf = pool.acquire();
			buf.copy_from_slice(&[1u8; 8]);
		}
		let buf = pool.acquire();
		assert_eq!(&buf[..], &[0u8; 8]);
	}
}
