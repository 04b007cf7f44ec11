//! Goblet is a read-through HTTP cache in front of Git Smart-HTTP v2
//! origins: it mirrors each upstream repository into a local bare repo,
//! single-flights concurrent refreshes, and serves `ls-refs`/`fetch`
//! directly from the mirror under a freshness policy.

pub mod auth;
pub mod canonical;
pub mod config;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod freshness;
pub mod http;
pub mod materializer;
pub mod mirror;
pub mod oid;
pub mod pktline;
pub mod singleflight;
pub mod state;
pub mod upstream;
