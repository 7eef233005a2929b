use anyhow::{Result, anyhow};

use tmcli_core::AuthSession;

use crate::app::App;

/// Execute the models command
///
/// Device-flow identities query the model service; static-key identities
/// only have their configured model.
pub async fn execute(app: &App) -> Result<()> {
    let auth_type = app.config().auth_type;
    let catalog = app.gateway().catalog();

    if auth_type.is_oauth() {
        app.gateway()
            .authenticate(&AuthSession::default(), true)
            .await?;
        let result = app.gateway().refresh_models().await;
        if let Some(error) = result.error {
            return Err(anyhow!("Failed to fetch models: {}", error));
        }
    }

    let models = catalog.available_models(auth_type, &app.config().model);
    if models.is_empty() {
        println!("No models available for {}", auth_type);
        return Ok(());
    }
    for model in models {
        let marker = if model.id == app.config().model { "*" } else { " " };
        println!("{} {}", marker, model.label);
    }
    Ok(())
}
