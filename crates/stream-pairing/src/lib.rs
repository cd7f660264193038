// Pairing and discovery for streamlinux.
//
// - token.rs: short-lived CSPRNG session tokens with constant-time checks
// - bundle.rs: the pairing bundle a viewer scans to find the host
// - qr.rs: bundle rendering (PNG bytes, terminal output)
// - mdns.rs: local-network service advertisement

pub mod bundle;
pub mod mdns;
pub mod qr;
pub mod token;

pub use bundle::PairingBundle;
pub use mdns::MdnsAdvertiser;
pub use token::{TokenStore, TokenValidation, DEFAULT_TOKEN_TTL};
