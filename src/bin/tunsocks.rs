//! tunsocks binary: SOCKS5 port-forwarding from the command line

use anyhow::{bail, Context, Result};
use tracing::{error, info};
use tunsocks::{ForwardSpec, ProxyConfig, Tunnel};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const APP_NAME: &str = "tunsocks";

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Parse command line arguments
    let mut args = std::env::args().skip(1);
    let mut server_addr = "127.0.0.1:1080".to_string();
    let mut username = None;
    let mut password = None;
    let mut forwards: Vec<ForwardSpec> = Vec::new();
    let mut reverse_forwards: Vec<ForwardSpec> = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-s" | "--server" => {
                server_addr = args.next().context("Expected proxy address after -s")?;
            }
            "-u" | "--user" => {
                username = Some(args.next().context("Expected username after -u")?);
            }
            "-w" | "--password" => {
                password = Some(args.next().context("Expected password after -w")?);
            }
            "-L" | "--forward" => {
                let value = args.next().context("Expected forward spec after -L")?;
                forwards.push(parse_forward_spec(&value)?);
            }
            "-R" | "--reverse-forward" => {
                let value = args.next().context("Expected forward spec after -R")?;
                reverse_forwards.push(parse_forward_spec(&value)?);
            }
            "-V" | "--version" => {
                println!("{APP_NAME} {VERSION}");
                return Ok(());
            }
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            other => {
                bail!("Unknown argument: {other} (try --help)");
            }
        }
    }

    let username = username.context("Missing required -u <user>")?;
    let password = password.context("Missing required -w <password>")?;
    if forwards.is_empty() && reverse_forwards.is_empty() {
        bail!("Nothing to do: add at least one -L or -R forward");
    }

    let (proxy_host, proxy_port) = parse_host_port(&server_addr)?;

    let tunnel = Tunnel::new()?;
    for spec in forwards {
        tunnel.add_forward(
            spec,
            Some(Box::new(|remote_host, remote_port, listen_host, listen_port| {
                info!(
                    "forward ready: {}:{} -> {}:{}",
                    listen_host, listen_port, remote_host, remote_port
                );
            })),
        )?;
    }
    for spec in reverse_forwards {
        tunnel.add_reverse_forward(
            spec,
            Some(Box::new(|remote_host, remote_port, listen_host, listen_port| {
                info!(
                    "reverse forward ready: {}:{} -> {}:{}",
                    listen_host, listen_port, remote_host, remote_port
                );
            })),
        )?;
    }

    tunnel.start(
        ProxyConfig::new(proxy_host, proxy_port, username, password),
        Some(Box::new(|status| {
            error!("tunnel status: {:?}", status);
        })),
    )?;

    // The reactor runs on its own thread; park here until interrupted.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let _ = tokio::signal::ctrl_c().await;
    });

    info!("Shutting down");
    tunnel.close();
    Ok(())
}

fn print_help() {
    println!("Usage: {APP_NAME} [OPTIONS]");
    println!("Options:");
    println!("  -s, --server <host:port>        SOCKS5 proxy address (default: 127.0.0.1:1080)");
    println!("  -u, --user <name>               Proxy username");
    println!("  -w, --password <password>       Proxy password");
    println!("  -L, --forward <spec>            Local forward, spec is");
    println!("                                  listen_host:listen_port:remote_host:remote_port");
    println!("  -R, --reverse-forward <spec>    Reverse forward, same spec shape");
    println!("  -V, --version                   Print version");
    println!("  -h, --help                      Show this help");
}

/// Parse `listen_host:listen_port:remote_host:remote_port`.
fn parse_forward_spec(value: &str) -> Result<ForwardSpec> {
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 4 {
        bail!("Invalid forward spec '{value}': expected listen_host:listen_port:remote_host:remote_port");
    }
    let listen_port: u16 = parts[1]
        .parse()
        .with_context(|| format!("Invalid listen port in '{value}'"))?;
    let remote_port: u16 = parts[3]
        .parse()
        .with_context(|| format!("Invalid remote port in '{value}'"))?;
    Ok(ForwardSpec::new(parts[0], listen_port, parts[2], remote_port))
}

/// Parse `host:port`.
fn parse_host_port(value: &str) -> Result<(String, u16)> {
    let (host, port) = value
        .rsplit_once(':')
        .with_context(|| format!("Invalid address '{value}': expected host:port"))?;
    let port: u16 = port
        .parse()
        .with_context(|| format!("Invalid port in '{value}'"))?;
    Ok((host.to_string(), port))
}
