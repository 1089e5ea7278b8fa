//! JOSE primitives: base64url, compact JWS handling, and JWK key material.

pub mod jwk;
pub mod jws;

pub use jwk::Jwk;
pub use jws::{b64url_decode, b64url_encode, CompactJws, JoseError};
