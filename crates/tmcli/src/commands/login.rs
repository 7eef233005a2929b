use anyhow::{Result, bail};
use tracing::info;

use tmcli_core::AuthSession;

use crate::app::App;
use crate::ui;

/// Execute the login command
///
/// Reuses valid stored credentials; otherwise runs the device
/// authorization flow and stores what it issues.
pub async fn execute(app: &App) -> Result<()> {
    if !app.config().auth_type.is_oauth() {
        bail!(
            "Login is only needed for `dingtalk-oauth`; the configured auth type is `{}`",
            app.config().auth_type
        );
    }

    info!("Starting OAuth login flow");
    let (session, events) = AuthSession::new();
    let printer = ui::spawn_event_printer(events);
    let _cancel = ui::cancel_on_ctrl_c(&session);

    let result = app.gateway().authenticate(&session, false).await;
    drop(session);
    let _ = printer.await;

    let credentials = result?;
    println!(
        "Logged in. Credentials stored at {}",
        app.gateway().tokens().store().path().display()
    );
    if let Some(resource_url) = credentials.resource_url {
        println!("Resource endpoint: {}", resource_url);
    }
    Ok(())
}

/// Execute the logout command
pub fn logout(app: &App) -> Result<()> {
    app.gateway().logout()?;
    println!("Logged out.");
    Ok(())
}
