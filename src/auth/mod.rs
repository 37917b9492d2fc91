//! CONNECT/LOGIN handshake
//!
//! Transport capability negotiation, protocol version agreement and digest
//! challenge-response authentication.

pub mod digest;
pub mod negotiator;

pub use digest::PasswordDigest;
pub use negotiator::{
    build_secret, is_admin_user, AuthMode, AuthNegotiator, AuthState, AuthType, Challenge,
    ConnectionRoute, FeatureVersion, LoginInfo, LoginOutcome, TransportCaps, PUBLIC_DATABASE_ID,
};
