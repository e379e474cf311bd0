//! Self-signed certificate issuance and the certificate cache.
//!
//! When a configuration carries a CA instead of a static certificate, every
//! handshake is answered with a leaf signed by that CA. Leaves are keyed by
//! SNI hostname, or by the set of known client IPs when no SNI was sent, and
//! are replaced once they come within the rotation threshold of expiry.

pub mod cache;
pub mod codec;
pub mod issuer;

pub use cache::{ip_key, rotation_threshold, CertificateCache, KnownIps};
pub use codec::LeafCertificate;
pub use issuer::{CaIssuer, PLACEHOLDER_CN};
