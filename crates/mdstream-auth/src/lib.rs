//! Connection credentials for exchanges that gate WebSocket access.
//!
//! KuCoin requires a REST call to `/api/v1/bullet-public` before every
//! connection; the response carries the instance server, a short-lived
//! token and the client ping interval. `BulletTokenProvider` caches that
//! token and refreshes it ahead of expiry, and implements
//! `mdstream_ws::EndpointProvider` so sessions resolve through it.

pub mod bullet;
pub mod error;
pub mod provider;

pub use bullet::{normalize_ws_endpoint, BulletClient, ConnectToken, TokenSource};
pub use error::{AuthError, AuthResult};
pub use provider::{BulletConfig, BulletTokenProvider};
