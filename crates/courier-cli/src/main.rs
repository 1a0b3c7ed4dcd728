//! # Courier CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Serve ping, echo and plus, registered in the configured registry
//! courier serve -c courier.json --server-type chat --server-id chat-1
//!
//! # Call a server by id (outputs raw JSON)
//! courier call -c courier.json chat-1 plus --args '[1, 2]'
//!
//! # Call whichever chat server the router picks for a seed
//! courier call -c courier.json --route chat --seed room-7 echo --args '"hi"'
//!
//! # List registered servers
//! courier servers -c courier.json
//! ```

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use argh::FromArgs;

use courier_cli::{CallTarget, ServerOverrides};
use courier_registry::RegistryFactory;

#[derive(FromArgs)]
/// courier: RPC and service discovery for multi-process servers
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
    Servers(ServersArgs),
}

/// Arguments for running a server.
///
/// The server binds `port` (moving to a free one when `autoport` is on),
/// registers itself and serves until interrupted.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run a courier server with the demo services
struct ServeArgs {
    /// path to a JSON config file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// port to listen on
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// server type to register under
    #[argh(option, long = "server-type")]
    server_type: Option<String>,

    /// server id to register under (defaults to `host(type):port`)
    #[argh(option, long = "server-id")]
    server_id: Option<String>,
}

/// Arguments for making a single RPC call.
///
/// Outputs the raw JSON result on stdout; errors go to stderr with a
/// non-zero exit code.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// call a service on a courier server
struct CallArgs {
    /// path to a JSON config file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// route by server type instead of naming a server id
    #[argh(option, long = "route")]
    route: Option<String>,

    /// routing seed for sticky selection with --route
    #[argh(option, long = "seed")]
    seed: Option<String>,

    /// JSON arguments: an array is the argument list, anything else one argument
    #[argh(option, short = 'a', long = "args", default = "\"[]\".into()")]
    args: String,

    /// server id followed by service name, or only the service name with --route
    #[argh(positional)]
    targets: Vec<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "servers")]
/// print the registered servers as JSON
struct ServersArgs {
    /// path to a JSON config file
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call and servers keep stdout clean for piping
    if matches!(cli.command, Commands::Serve(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let factory = RegistryFactory::new();
    match cli.command {
        Commands::Serve(args) => {
            let mut config = courier_cli::load_config(args.config.as_deref())?;
            ServerOverrides {
                port: args.port,
                server_type: args.server_type,
                server_id: args.server_id,
            }
            .apply(&mut config.server);

            let endpoint = courier_cli::serve(&config, &factory).await?;
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            endpoint.stop(false).await;
            // Let the grace window close outstanding mailboxes
            tokio::time::sleep(config.client.grace_timeout()).await;
            Ok(())
        }
        Commands::Call(args) => {
            let config = courier_cli::load_config(args.config.as_deref())?;
            let (target, service) = call_target(&args)?;
            let call_args = courier_cli::parse_call_args(&args.args)?;
            let result = courier_cli::call(&config, &factory, &target, &service, call_args).await?;
            println!("{}", serde_json::to_string(&result)?);
            Ok(())
        }
        Commands::Servers(args) => {
            let config = courier_cli::load_config(args.config.as_deref())?;
            let servers = courier_cli::list_servers(&config, &factory).await?;
            println!("{}", serde_json::to_string_pretty(&servers)?);
            Ok(())
        }
    }
}

fn call_target(args: &CallArgs) -> Result<(CallTarget, String)> {
    match (&args.route, args.targets.as_slice()) {
        (Some(server_type), [service]) => Ok((
            CallTarget::Route {
                server_type: server_type.clone(),
                seed: args.seed.clone(),
            },
            service.clone(),
        )),
        (None, [server_id, service]) => Ok((CallTarget::Server(server_id.clone()), service.clone())),
        (Some(_), _) => Err(anyhow!("expected: courier call --route <type> <service>")),
        (None, _) => Err(anyhow!("expected: courier call <server-id> <service>")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_serve() {
        let args: Cli = Cli::from_args(
            &["courier"],
            &["serve", "-c", "courier.json", "--port", "4000", "--server-type", "chat"],
        )
        .unwrap();
        match args.command {
            Commands::Serve(ServeArgs { config, port, server_type, server_id }) => {
                assert_eq!(config, Some(PathBuf::from("courier.json")));
                assert_eq!(port, Some(4000));
                assert_eq!(server_type, Some("chat".to_string()));
                assert!(server_id.is_none());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_call_by_id() {
        let args: Cli = Cli::from_args(&["courier"], &["call", "chat-1", "plus", "-a", "[1,2]"]).unwrap();
        match args.command {
            Commands::Call(call) => {
                assert_eq!(call.args, "[1,2]");
                let (target, service) = call_target(&call).unwrap();
                assert_eq!(target, CallTarget::Server("chat-1".to_string()));
                assert_eq!(service, "plus");
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_call_by_route() {
        let args: Cli = Cli::from_args(
            &["courier"],
            &["call", "--route", "chat", "--seed", "room-7", "echo"],
        )
        .unwrap();
        match args.command {
            Commands::Call(call) => {
                assert_eq!(call.args, "[]");
                let (target, service) = call_target(&call).unwrap();
                assert_eq!(
                    target,
                    CallTarget::Route {
                        server_type: "chat".to_string(),
                        seed: Some("room-7".to_string()),
                    }
                );
                assert_eq!(service, "echo");
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_call_target_rejects_wrong_arity() {
        let args: Cli = Cli::from_args(&["courier"], &["call", "plus"]).unwrap();
        match args.command {
            Commands::Call(call) => assert!(call_target(&call).is_err()),
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_cli_parse_servers() {
        let args: Cli = Cli::from_args(&["courier"], &["servers"]).unwrap();
        assert!(matches!(args.command, Commands::Servers(ServersArgs { config: None })));
    }
}
