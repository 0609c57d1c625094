pub mod clock;

pub mod prelude {
	pub use std::fmt::{Debug, Display};
	pub use std::future::Future;
	pub use std::pin::Pin;
	pub use std::sync::Arc;
	pub use std::task::{Context, Poll};
	pub use std::time::Duration;

	pub use bytes::Bytes;
	pub use tracing::{debug, error, info, trace, warn};
}
