use async_trait::async_trait;
use http_body_util::{BodyExt, Empty};

use super::{Body, HttpRoundTripper, OriginError};

/// Synthesizes a response with a fixed status code and empty body. Used for
/// health-check-style ingress rules that never touch a real origin.
#[derive(Debug, Clone, Copy)]
pub struct StatusOrigin {
	pub code: u16,
}

impl StatusOrigin {
	pub fn new(code: u16) -> Self {
		Self { code }
	}

	pub fn identifier(&self) -> String {
		format!("status:{}", self.code)
	}
}

#[async_trait]
impl HttpRoundTripper for StatusOrigin {
	async fn round_trip(&self, _req: ::http::Request<Body>) -> Result<::http::Response<Body>, OriginError> {
		let body: Body = Empty::new().map_err(|never: std::convert::Infallible| match never {}).boxed();
		::http::Response::builder()
			.status(self.code)
			.body(body)
			.map_err(|e| OriginError::RoundTrip(e.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn synthesizes_configured_status_with_empty_body() {
		let origin = StatusOrigin::new(404);
		let req = ::http::Request::builder().body(Empty::new().map_err(|n: std::convert::Infallible| match n {}).boxed()).unwrap();
		let resp = origin.round_trip(req).await.unwrap();
		assert_eq!(resp.status(), 404);
	}
}
