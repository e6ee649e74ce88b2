//! OAuth2/PKCE authorization for the remote tool provider
//!
//! Owns the single user's token lifecycle: PKCE redirect generation, code
//! exchange, refresh, and the token store that the tool-protocol client reads
//! bearer tokens from. The crate has no dependency on the tool client or the
//! HTTP service and can be tested on its own.
//!
//! Authorization flow:
//! 1. `AuthFlow::begin_authorization()` stores a PKCE verifier + state nonce
//!    and returns the provider's authorization URL
//! 2. The provider redirects back with `code` and `state`
//! 3. `AuthFlow::complete_authorization()` checks the state, exchanges the
//!    code via `token::exchange_code()` and stores the token
//! 4. `AuthFlow::get_valid_token()` refreshes inline when the token is within
//!    60 seconds of expiry
//! 5. A rejected refresh clears the store, so the user must log in again

pub mod error;
pub mod flow;
pub mod pkce;
pub mod settings;
pub mod store;
pub mod token;

pub use error::{Error, Result};
pub use flow::{AuthFlow, PendingAuthorization, REFRESH_MARGIN};
pub use pkce::{build_authorization_url, compute_challenge, generate_state, generate_verifier};
pub use settings::OAuthSettings;
pub use store::{TokenData, TokenStore, now_millis};
pub use token::{TokenResponse, exchange_code, refresh_token};
