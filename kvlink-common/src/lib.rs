// kvlink-common - Wire types shared by the kvlink client and reference server
//
// This crate defines the reply model, the RESP frame codec and script digests

pub mod digest;
pub mod error;
pub mod frame;
pub mod reply;

// Re-export for convenience
pub use digest::sha1_hex;
pub use error::*;
pub use frame::*;
pub use reply::*;
