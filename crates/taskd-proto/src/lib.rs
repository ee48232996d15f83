// Re-export compiled gRPC protos.
//
// We keep the `.proto` contract within this crate so other crates can
// depend on a single Rust type source.

pub mod taskd {
    pub mod v1 {
        tonic::include_proto!("taskd.v1");
    }
}

pub use taskd::v1 as taskd_v1;
