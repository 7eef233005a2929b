use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tmcli_core::AuthType;

/// tmcli - authenticated model gateway
#[derive(Parser, Debug, Clone)]
#[command(name = "tmcli")]
#[command(about = "Talk to your model provider through an authenticated gateway")]
#[command(version)]
pub struct Cli {
    /// Model to use for this run
    #[arg(short, long, value_name = "MODEL")]
    pub model: Option<String>,

    /// How to authenticate: `openai` or `dingtalk-oauth`
    #[arg(long, value_name = "TYPE")]
    pub auth_type: Option<AuthType>,

    /// Single prompt to send (reads stdin when omitted)
    #[arg(short, long, value_name = "TEXT")]
    pub prompt: Option<String>,

    /// Wait for the whole response instead of streaming it
    #[arg(long)]
    pub no_stream: bool,

    /// Path to configuration file
    #[arg(long, value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Print the verification URL instead of opening a browser
    #[arg(long)]
    pub no_browser: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Sign in with the device authorization flow
    Login,
    /// Remove stored credentials
    Logout,
    /// List the models available to the signed-in identity
    Models,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::parse_from([
            "tmcli",
            "--auth-type",
            "openai",
            "-m",
            "qwen3-coder-plus",
            "-p",
            "Hello",
        ]);
        assert_eq!(cli.auth_type, Some(AuthType::OpenAi));
        assert_eq!(cli.model.as_deref(), Some("qwen3-coder-plus"));
        assert_eq!(cli.prompt, Some("Hello".to_string()));
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_subcommand_parsing() {
        let cli = Cli::parse_from(["tmcli", "--no-browser", "login"]);
        assert!(cli.no_browser);
        assert!(matches!(cli.command, Some(Commands::Login)));

        assert!(Cli::try_parse_from(["tmcli", "--auth-type", "qwen-oauth"]).is_err());
    }
}
