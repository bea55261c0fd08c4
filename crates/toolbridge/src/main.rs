//! Toolbridge - command-line host for MCP tool servers.
//!
//! Loads an `mcpServers` configuration document and lets you inspect and
//! call the servers it describes.

mod commands;
mod logging;

use clap::Parser;
use commands::Commands;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "toolbridge")]
#[command(author, version, about = "Inspect and call MCP tool servers", long_about = None)]
struct Cli {
    /// Path to the server configuration document
    #[arg(short, long, default_value = "mcp.json")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Print authorization URLs instead of opening a browser
    #[arg(long)]
    no_browser: bool,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let config = commands::load_config(&cli.config)?;
    commands::handle(cli.command, &config, !cli.no_browser).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_call() {
        let cli = Cli::try_parse_from([
            "toolbridge",
            "--config",
            "servers.json",
            "call",
            "fs",
            "read_file",
            "--args",
            r#"{"path":"a"}"#,
            "--no-retry",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("servers.json"));
        match cli.command {
            Commands::Call {
                server,
                tool,
                args,
                no_retry,
                timeout,
            } => {
                assert_eq!(server, "fs");
                assert_eq!(tool, "read_file");
                assert_eq!(args, r#"{"path":"a"}"#);
                assert!(no_retry);
                assert!(timeout.is_none());
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn test_prompt_args_require_get() {
        assert!(Cli::try_parse_from(["toolbridge", "prompts", "s", "--arg", "a=b"]).is_err());
        assert!(
            Cli::try_parse_from(["toolbridge", "prompts", "s", "--get", "p", "--arg", "a=b"]).is_ok()
        );
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["toolbridge"]).is_err());
    }
}
