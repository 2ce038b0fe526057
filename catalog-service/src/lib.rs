//! # Catalog Service
//!
//! **INTERNAL USE ONLY**: This crate exists solely to provide the Protobuf schema of a
//! small product catalog used by the `gantry_core` integration tests.
//! It is not intended for production use.
use prost_reflect::{DescriptorError, DescriptorPool, ServiceDescriptor};

pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("descriptors");

/// Fully qualified name of the test service.
pub const SERVICE_NAME: &str = "catalog.Catalog";

/// Decodes the embedded descriptor set into a pool.
pub fn descriptor_pool() -> Result<DescriptorPool, DescriptorError> {
    DescriptorPool::decode(FILE_DESCRIPTOR_SET)
}

/// Returns the descriptor of the `catalog.Catalog` service.
///
/// # Panics
///
/// Panics if the embedded descriptor set is corrupt, which would be a build bug.
pub fn catalog_service() -> ServiceDescriptor {
    descriptor_pool()
        .expect("embedded descriptor set is valid")
        .get_service_by_name(SERVICE_NAME)
        .expect("catalog.Catalog is defined in catalog.proto")
}
