//! Stevedore gRPC API
//!
//! This crate defines the gRPC protocols spoken by the agent: the
//! deployment-platform facing build service (`stevedore.v1`) and the build
//! engine solve protocol (`engine.v1`). The protobuf definitions live in
//! `proto/` and are code-generated via `tonic-build`.

// Include the generated code
pub mod stevedore {
    pub mod v1 {
        tonic::include_proto!("stevedore.v1");
    }
}

pub mod engine {
    pub mod v1 {
        tonic::include_proto!("engine.v1");
    }
}
