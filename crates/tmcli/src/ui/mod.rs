//! Terminal output for the login flow.

use std::io::{self, Write};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use tmcli_core::{AuthEvent, AuthProgress, AuthSession};

/// Renders authentication events on stderr until every sender is gone.
pub fn spawn_event_printer(mut events: mpsc::UnboundedReceiver<AuthEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stderr = io::stderr();
        while let Some(event) = events.recv().await {
            match event {
                AuthEvent::AuthorizationUri(authorization) => {
                    let _ = writeln!(
                        stderr,
                        "Sign in at {} and confirm code {}",
                        authorization.browser_uri(),
                        authorization.user_code
                    );
                }
                AuthEvent::Progress {
                    status: AuthProgress::Polling,
                    message,
                } => {
                    let _ = write!(stderr, "\r{}", message);
                    let _ = stderr.flush();
                }
                AuthEvent::Progress {
                    status: AuthProgress::Success,
                    message,
                } => {
                    let _ = writeln!(stderr, "\n{}", message);
                }
                AuthEvent::Progress { status, message } => {
                    let _ = writeln!(stderr, "\n[{}] {}", status, message);
                }
            }
        }
    })
}

/// Cancels `session` on Ctrl-C for as long as the guard lives.
pub fn cancel_on_ctrl_c(session: &AuthSession) -> CtrlCGuard {
    let cancel = session.cancel_token();
    let task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Ctrl-C received, cancelling authentication");
            cancel.cancel();
        }
    });
    CtrlCGuard { task }
}

pub struct CtrlCGuard {
    task: JoinHandle<()>,
}

impl Drop for CtrlCGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}
