//! Bearer tokens and the server-scoped validator.
//!
//! A token is valid iff it exists, has not expired, and has not been
//! revoked. It is valid *for a server* iff its server-access map contains an
//! explicit `true` for that server - absence means denied. Token contents
//! are never logged; log sites see only the redacted id.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod token;
mod validator;

pub use token::Token;
pub use validator::{AuthError, AuthResult, TokenLookup, TokenValidator};
