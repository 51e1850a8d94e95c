//! Identity, signing and encryption primitives for Tide.
//!
//! - [`Keypair`] / [`Identity`]: ed25519 keys. An identity's `id` is the hex
//!   form of its public key, so an identity can be checked for consistency
//!   without any external registry.
//! - [`SharedKey`]: symmetric XChaCha20-Poly1305 key used to encrypt entry
//!   payloads. A wrong key always fails authentication, it never yields
//!   corrupted plaintext.

pub mod codec;
pub mod error;
pub mod identity;

pub use codec::{SharedKey, decrypt, encrypt};
pub use error::{CryptoError, Result};
pub use identity::{Identity, Keypair};
