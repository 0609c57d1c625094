//! Matches an inbound (host, path) pair to an origin service.

use regex::Regex;

use crate::origin::OriginService;

#[derive(Debug, Clone, Default)]
pub struct RuleConfig {
	/// Rewrites transfer-encoding to `gzip, deflate` and takes content-length
	/// from the header instead, for WSGI-style origins that choke on chunked
	/// bodies.
	pub disable_chunked_encoding: bool,
	/// If set, overwrites the request Host header and authority before egress.
	pub host_header_override: Option<String>,
}

pub struct IngressRule {
	host_glob: Regex,
	path_regex: Option<Regex>,
	pub service: OriginService,
	pub config: RuleConfig,
}

impl IngressRule {
	pub fn new(host_glob_pattern: &str, path_pattern: Option<&str>, service: OriginService, config: RuleConfig) -> Result<Self, regex::Error> {
		Ok(Self {
			host_glob: Regex::new(&glob_to_regex(host_glob_pattern))?,
			path_regex: path_pattern.map(Regex::new).transpose()?,
			service,
			config,
		})
	}

	pub fn catch_all(service: OriginService) -> Self {
		Self {
			host_glob: Regex::new(&glob_to_regex("*")).expect("catch-all glob is always valid"),
			path_regex: None,
			service,
			config: RuleConfig::default(),
		}
	}

	fn matches(&self, host: &str, path: &str) -> bool {
		self.host_glob.is_match(host) && self.path_regex.as_ref().is_none_or(|re| re.is_match(path))
	}
}

/// Translates a shell-style host glob (`*` and `?`) into an anchored regex.
fn glob_to_regex(glob: &str) -> String {
	let mut out = String::from("^");
	for c in glob.chars() {
		match c {
			'*' => out.push_str(".*"),
			'?' => out.push('.'),
			'.' | '+' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$' | '\\' => {
				out.push('\\');
				out.push(c);
			},
			c => out.push(c),
		}
	}
	out.push('$');
	out
}

/// Ordered list of rules, the last of which must be a catch-all matching any
/// (host, path). Exactly one rule always matches.
pub struct Ingress {
	rules: Vec<IngressRule>,
}

#[derive(Debug, thiserror::Error)]
#[error("ingress has no rules")]
pub struct EmptyIngress;

impl Ingress {
	pub fn new(rules: Vec<IngressRule>) -> Result<Self, EmptyIngress> {
		if rules.is_empty() {
			return Err(EmptyIngress);
		}
		Ok(Self { rules })
	}

	/// Returns the first matching rule along with its index.
	pub fn find_matching_rule(&self, host: &str, path: &str) -> (&IngressRule, usize) {
		self
			.rules
			.iter()
			.enumerate()
			.find(|(_, rule)| rule.matches(host, path))
			.map(|(i, rule)| (rule, i))
			.unwrap_or_else(|| {
				let last = self.rules.len() - 1;
				(&self.rules[last], last)
			})
	}
}

#[cfg(test)]
mod tests {
	use crate::origin::{OriginService, StatusOrigin};

	use super::*;

	fn ingress() -> Ingress {
		Ingress::new(vec![
			IngressRule::new("api.example.com", None, OriginService::Status(StatusOrigin::new(200)), RuleConfig::default()).unwrap(),
			IngressRule::new("hello.example.com", None, OriginService::HelloWorld(Default::default()), RuleConfig::default()).unwrap(),
			IngressRule::new("health.example.com", Some("^/health$"), OriginService::Status(StatusOrigin::new(200)), RuleConfig::default()).unwrap(),
			IngressRule::catch_all(OriginService::Status(StatusOrigin::new(404))),
		])
		.unwrap()
	}

	#[test]
	fn every_host_path_pair_matches_exactly_one_rule() {
		let ingress = ingress();
		let (_, idx) = ingress.find_matching_rule("health.example.com", "/");
		assert_eq!(idx, 3, "unmatched path on a path-scoped rule falls through to catch-all");
		let (_, idx) = ingress.find_matching_rule("health.example.com", "/health");
		assert_eq!(idx, 2);
		let (_, idx) = ingress.find_matching_rule("not-found.example.com", "/anything");
		assert_eq!(idx, 3);
	}

	#[test]
	fn glob_star_matches_any_host() {
		let rule = IngressRule::catch_all(OriginService::Status(StatusOrigin::new(404)));
		assert!(rule.matches("literally.anything", "/x"));
	}
}
