//! Command handlers.

use anyhow::{bail, Context};
use clap::Subcommand;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use toolbridge_mcp::{
    Capability, ExecuteOptions, McpClient, McpClientOptions, McpConfigFile, McpError,
    ServerConfig, ToolCallResult,
};
use tracing::info;

#[derive(Subcommand)]
pub enum Commands {
    /// List configured servers
    Servers,
    /// Connect to a server and list its tools
    Tools {
        /// Server key
        server: String,
        /// Print each tool's parameter schema
        #[arg(long)]
        schema: bool,
    },
    /// Call a tool
    Call {
        /// Server key
        server: String,
        /// Tool name as advertised by the server
        tool: String,
        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
        /// Request timeout in milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Do not retry failed calls
        #[arg(long)]
        no_retry: bool,
    },
    /// Run the OAuth authorization flow for a server
    Auth {
        /// Server key
        server: String,
    },
    /// List a server's resources
    Resources {
        /// Server key
        server: String,
        /// Read this resource instead of listing
        #[arg(short, long)]
        read: Option<String>,
    },
    /// List a server's prompts
    Prompts {
        /// Server key
        server: String,
        /// Render this prompt instead of listing
        #[arg(short, long)]
        get: Option<String>,
        /// Prompt argument as key=value, repeatable
        #[arg(long = "arg", requires = "get")]
        args: Vec<String>,
    },
}

/// Load the configuration document at `path`.
pub fn load_config(path: &Path) -> anyhow::Result<McpConfigFile> {
    McpConfigFile::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Build a client over the enabled entries of `config`.
pub fn build_client(config: &McpConfigFile, interactive: bool) -> Arc<McpClient> {
    let options = McpClientOptions {
        interactive,
        ..McpClientOptions::default()
    };
    Arc::new(McpClient::with_options(config.enabled_servers(), options))
}

pub async fn handle(
    command: Commands,
    config: &McpConfigFile,
    interactive: bool,
) -> anyhow::Result<()> {
    let client = build_client(config, interactive);
    let result = match command {
        Commands::Servers => {
            list_servers(config);
            Ok(())
        }
        Commands::Tools { server, schema } => list_tools(&client, &server, schema).await,
        Commands::Call {
            server,
            tool,
            args,
            timeout,
            no_retry,
        } => call_tool(&client, &server, &tool, &args, timeout, no_retry).await,
        Commands::Auth { server } => authorize(&client, &server).await,
        Commands::Resources { server, read } => resources(&client, &server, read).await,
        Commands::Prompts { server, get, args } => prompts(&client, &server, get, &args).await,
    };
    client.disconnect_all().await;
    result
}

fn list_servers(config: &McpConfigFile) {
    if config.mcp_servers.is_empty() {
        println!("No MCP servers configured.");
        return;
    }

    println!("{:<20} {:<16} {}", "NAME", "TYPE", "ENDPOINT");
    println!("{}", "-".repeat(60));
    for (name, cfg) in &config.mcp_servers {
        let (kind, endpoint) = describe(cfg);
        let status = if cfg.disabled { " (disabled)" } else { "" };
        println!("{:<20} {:<16} {}{}", name, kind, endpoint, status);
    }
}

fn describe(cfg: &ServerConfig) -> (String, String) {
    match (&cfg.command, &cfg.url) {
        (Some(command), _) => {
            let mut line = command.clone();
            for arg in &cfg.args {
                line.push(' ');
                line.push_str(arg);
            }
            ("stdio".to_string(), line)
        }
        (None, Some(url)) => (cfg.http_mode().to_string(), url.clone()),
        (None, None) => ("unknown".to_string(), String::new()),
    }
}

async fn list_tools(client: &Arc<McpClient>, server: &str, schema: bool) -> anyhow::Result<()> {
    client.connect_to_server(server).await?;
    let definitions = client.get_tool_definitions(server).await?;
    if definitions.is_empty() {
        println!("{server} advertises no tools.");
        return Ok(());
    }

    for tool in definitions.iter() {
        let approved = if client.auto_approved(server, &tool.original_name) {
            " [auto-approved]"
        } else {
            ""
        };
        println!("{}{}", tool.name, approved);
        println!("    {}", tool.description);
        if schema {
            println!("    {}", serde_json::to_string(&tool.parameters_schema())?);
        }
    }
    Ok(())
}

async fn call_tool(
    client: &Arc<McpClient>,
    server: &str,
    tool: &str,
    args: &str,
    timeout: Option<u64>,
    no_retry: bool,
) -> anyhow::Result<()> {
    let arguments: Value = serde_json::from_str(args).context("--args must be valid JSON")?;
    client.connect_to_server(server).await?;

    let options = ExecuteOptions {
        timeout: timeout.map(Duration::from_millis),
        retry: no_retry.then_some(false),
        cancel: None,
    };
    let result = client
        .execute_tool(server, tool, arguments, false, options)
        .await?;

    println!("{}", result.text());
    if result.is_error {
        bail!("{tool} reported an error");
    }
    Ok(())
}

async fn authorize(client: &Arc<McpClient>, server: &str) -> anyhow::Result<()> {
    match client.connect_to_server(server).await {
        Ok(()) => {
            println!("{server} is already authorized.");
            return Ok(());
        }
        Err(e @ McpError::Authentication { .. }) => eprintln!("{e}"),
        Err(e) => return Err(e.into()),
    }

    eprint!("Paste the authorization code: ");
    let mut code = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut code)
        .await
        .context("Failed to read authorization code")?;
    let code = code.trim();
    if code.is_empty() {
        bail!("no authorization code entered");
    }

    client.complete_authentication(server, code).await?;
    client.connect_to_server(server).await?;
    info!(server = %server, "Authorized");
    println!("{server} authorized and connected.");
    Ok(())
}

async fn resources(
    client: &Arc<McpClient>,
    server: &str,
    read: Option<String>,
) -> anyhow::Result<()> {
    client.connect_to_server(server).await?;

    if let Some(uri) = read {
        match client.read_resource(server, &uri).await? {
            Capability::Supported(result) => {
                for content in result.contents {
                    match content.text {
                        Some(text) => println!("{text}"),
                        None => println!("<binary content: {}>", content.uri),
                    }
                }
            }
            Capability::NotSupported => println!("{server} does not support resources."),
        }
        return Ok(());
    }

    let listed = client.list_resources(server).await?;
    let templates = client.list_resource_templates(server).await?;
    if listed.is_empty() && templates.is_empty() {
        println!("{server} exposes no resources.");
    }
    for resource in listed {
        println!("{:<40} {}", resource.uri, resource.name);
    }
    for template in templates {
        println!("{:<40} {} (template)", template.uri_template, template.name);
    }
    Ok(())
}

async fn prompts(
    client: &Arc<McpClient>,
    server: &str,
    get: Option<String>,
    args: &[String],
) -> anyhow::Result<()> {
    client.connect_to_server(server).await?;

    if let Some(name) = get {
        let arguments = parse_pairs(args)?;
        match client.get_prompt(server, &name, arguments).await? {
            Capability::Supported(prompt) => {
                for message in prompt.messages {
                    let text = ToolCallResult {
                        content: vec![message.content],
                        is_error: false,
                    }
                    .text();
                    println!("{}: {}", message.role, text);
                }
            }
            Capability::NotSupported => println!("{server} does not support prompts."),
        }
        return Ok(());
    }

    let prompts = client.list_prompts(server).await?;
    if prompts.is_empty() {
        println!("{server} exposes no prompts.");
    }
    for prompt in prompts {
        let args: Vec<String> = prompt
            .arguments
            .iter()
            .map(|a| if a.required { a.name.clone() } else { format!("[{}]", a.name) })
            .collect();
        println!("{} {}", prompt.name, args.join(" "));
        if let Some(description) = prompt.description {
            println!("    {description}");
        }
    }
    Ok(())
}

/// Parse `key=value` pairs.
fn parse_pairs(pairs: &[String]) -> anyhow::Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .with_context(|| format!("expected key=value, got {pair}"))
        })
        .collect()
}
