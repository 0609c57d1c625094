pub mod backoff;
pub mod buffer_pool;
pub mod config;
pub mod credentials;
pub mod edge_pool;
pub mod flow_limiter;
pub mod ingress;
pub mod metrics;
pub mod muxer;
pub mod origin;
pub mod protocol;
pub mod proxy;
pub mod rpc;
pub mod supervisor;
pub mod transport;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testutil;

pub mod prelude {
	pub use tunnel_core::prelude::*;
}
