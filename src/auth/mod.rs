mod oidc;
pub mod session;

pub use oidc::{AuthError, OidcAuthenticator, is_authorized};
