//! # Dynamic gRPC Transport
//!
//! Low-level building blocks shared by the dispatcher and the outbound clients.
//!
//! Messages are plain `serde_json::Value`s: the [`codec::JsonCodec`] validates and transcodes
//! them to Protobuf binary format on the fly using `prost_reflect` descriptors.
pub mod client;
pub mod codec;
