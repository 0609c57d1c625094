use async_trait::async_trait;
use http_body_util::{BodyExt, Full};

use super::{Body, HttpRoundTripper, OriginError};

const PAGE: &str = "<html><body><h1>Congratulations!</h1><p>You reached the hello-world diagnostic origin.</p></body></html>";

/// In-process demo endpoint used for diagnostics. Unlike the other HTTP
/// variants it never dials out; it answers directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct HelloWorldOrigin;

impl HelloWorldOrigin {
	pub fn identifier(&self) -> String {
		"hello-world".to_string()
	}

	pub fn rewrite_origin_url(&self, path_and_query: &str) -> ::http::Uri {
		::http::Uri::builder()
			.scheme("https")
			.authority("hello-world.internal")
			.path_and_query(path_and_query)
			.build()
			.unwrap_or_else(|_| ::http::Uri::from_static("https://hello-world.internal/"))
	}
}

#[async_trait]
impl HttpRoundTripper for HelloWorldOrigin {
	async fn round_trip(&self, _req: ::http::Request<Body>) -> Result<::http::Response<Body>, OriginError> {
		let body: Body = Full::new(bytes::Bytes::from_static(PAGE.as_bytes()))
			.map_err(|never: std::convert::Infallible| match never {})
			.boxed();
		::http::Response::builder()
			.status(200)
			.header(::http::header::CONTENT_TYPE, "text/html")
			.body(body)
			.map_err(|e| OriginError::RoundTrip(e.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use http_body_util::Empty;

	use super::*;

	#[tokio::test]
	async fn answers_with_200_and_html_body() {
		let origin = HelloWorldOrigin;
		let req = ::http::Request::builder().body(Empty::new().map_err(|n: std::convert::Infallible| match n {}).boxed()).unwrap();
		let resp = origin.round_trip(req).await.unwrap();
		assert_eq!(resp.status(), 200);
	}
}
