//! OAuth authentication for tmcli.
//!
//! This module provides the OAuth2 device authorization grant (with PKCE),
//! the on-disk credential cache and the token lifecycle manager shared by
//! everything that talks to the model service.

pub mod credentials;
pub mod device_flow;
pub mod manager;
pub mod oauth;
pub mod pkce;
pub mod storage;

pub use credentials::{Credentials, EXPIRY_MARGIN_MS};
pub use device_flow::{
    AttemptState, AuthEvent, AuthFailure, AuthProgress, AuthSession, DeviceFlowAuthenticator,
    FailureReason,
};
pub use manager::{
    TokenErrorKind, TokenManager, TokenManagerError, is_auth_chat_error, is_auth_error,
};
pub use oauth::{
    DeviceAuthorization, DeviceOAuthClient, DeviceTokenPoll, HttpOAuthClient, OAuthClientConfig,
    OAuthError, TokenResponse,
};
pub use pkce::PkcePair;
pub use storage::{CredentialStore, StorageError};
