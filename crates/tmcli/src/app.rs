//! Application orchestration for tmcli
//!
//! Loads settings, applies environment and flag overrides, and owns the
//! [`Gateway`] every command goes through.

use std::io::{self, Write};

use anyhow::{Context, Result};
use futures::StreamExt;
use tracing::{debug, info};

use tmcli_core::config::{Config, load_config};
use tmcli_core::{AuthSession, Gateway, create_content_generator_config};
use tmwire::{Content, GenerateContentRequest};

use crate::cli::Cli;
use crate::ui;

/// Main application structure
pub struct App {
    config: Config,
    gateway: Gateway,
}

impl App {
    /// Create a new application instance from CLI arguments
    pub fn create(cli: &Cli) -> Result<Self> {
        let mut config = load_config(cli.config_file.as_deref()).context("Failed to load config")?;
        if let Some(auth_type) = cli.auth_type {
            config.auth_type = auth_type;
        }
        config.apply_env_overrides();
        if let Some(model) = &cli.model {
            config.model = model.clone();
        }
        if cli.no_browser {
            config.oauth.suppress_browser = true;
        }
        debug!(
            "Configuration loaded (auth type {}, default location: {})",
            config.auth_type, config.is_from_default_location
        );

        let gateway = Gateway::from_config(&config)?;
        Ok(Self { config, gateway })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// Sends one prompt and writes the answer to stdout.
    pub async fn run_prompt(&self, prompt: &str, stream: bool) -> Result<()> {
        let generator_config = create_content_generator_config(&self.config, self.config.auth_type)?;
        let (session, events) = AuthSession::new();
        let printer = ui::spawn_event_printer(events);
        let _cancel = ui::cancel_on_ctrl_c(&session);

        let generator = self
            .gateway
            .create_content_generator(generator_config, &session, false)
            .await;
        drop(session);
        // Let the printer flush whatever the login emitted
        let _ = printer.await;
        let generator = generator?;

        info!("Sending prompt to {}", generator.model_name());
        let mut request = GenerateContentRequest::new(generator.model_name(), vec![Content::user(prompt)]);
        request.stream = Some(stream);

        let mut stdout = io::stdout();
        if stream {
            let mut chunks = generator.generate_content_stream(request).await?;
            while let Some(chunk) = chunks.next().await {
                write!(stdout, "{}", chunk?.text())?;
                stdout.flush()?;
            }
            writeln!(stdout)?;
        } else {
            let response = generator.generate_content(request).await?;
            writeln!(stdout, "{}", response.text())?;
        }
        Ok(())
    }
}
