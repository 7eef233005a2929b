//! tmcli-core - Authenticated gateway between tmcli and its model providers
//!
//! Device-flow OAuth with PKCE, the shared token lifecycle manager, model
//! discovery and the generator factory live here. Wire formats are in
//! [`tmwire`].

pub mod auth;
pub mod config;
pub mod llm;
pub mod models;

pub use auth::{
    AuthEvent, AuthFailure, AuthProgress, AuthSession, Credentials, FailureReason, TokenManager,
    TokenManagerError,
};
pub use config::{AuthType, Config, ConfigError, ContentGeneratorConfig, load_config, save_config};
pub use llm::{CredentialedGenerator, FactoryError, Gateway, create_content_generator_config};
pub use models::{AvailableModel, ModelCatalog, ModelFetchError, ModelFetchErrorCode, ModelFetchResult};
