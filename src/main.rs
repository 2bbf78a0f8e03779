use std::{
    env, io,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    process::exit,
    sync::Arc,
};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use burrow::{
    args::{self, ArgumentsRequest, ClientConfig, HostConfig, StartupArguments, StartupRole},
    signaling, stats, tunnel,
};

fn main() {
    // With no arguments at all, fall back to interactive prompts.
    let startup_args = if env::args().len() <= 1 {
        match prompt_startup_interactively() {
            Ok(startup_args) => startup_args,
            Err(err) => {
                eprintln!("{err}");
                exit(1);
            }
        }
    } else {
        let arguments = match args::parse_arguments(env::args()) {
            Err(err) => {
                eprintln!("{err}\n\nType 'burrow --help' for a help menu");
                exit(1);
            }
            Ok(arguments) => arguments,
        };

        match arguments {
            ArgumentsRequest::Version => {
                println!("{}", args::get_version_string());
                return;
            }
            ArgumentsRequest::Help => {
                println!("{}", args::get_help_string());
                return;
            }
            ArgumentsRequest::Run(startup_args) => startup_args,
        }
    };

    init_logging(startup_args.debug);

    let runtime_result = tokio::runtime::Builder::new_multi_thread().enable_all().build();

    let result = match runtime_result {
        Ok(runtime) => runtime.block_on(async_main(startup_args)),
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    if let Err(error) = result {
        error!("{error}");
        exit(1);
    }
}

/// Gathers the same configuration as the CLI flags through stdin prompts.
fn prompt_startup_interactively() -> io::Result<StartupArguments> {
    println!("{}", args::get_version_string());
    println!();
    println!("Select your role:");
    println!("  1) Host   — expose a local service");
    println!("  2) Client — connect to a remote host");

    let role = loop {
        let choice = prompt_line("Enter your choice (1/2): ")?;
        match choice.trim() {
            "1" => break StartupRole::Host(HostConfig {
                target_port: prompt_port("Target port to forward (1-65535): ")?,
                ws_port: 0,
                ws_listen: false,
            }),
            "2" => {
                let ws_url = loop {
                    let raw = prompt_line("Signaling URL printed by the host: ")?;
                    match args::normalize_ws_url(&raw) {
                        Some(url) => break url,
                        None => println!("Invalid URL, please enter a host or ws:// URL"),
                    }
                };
                break StartupRole::Client(ClientConfig {
                    local_port: prompt_port("Local port for the virtual service (1-65535): ")?,
                    ws_url,
                });
            }
            _ => println!("Invalid choice, please enter 1 or 2"),
        }
    };

    Ok(StartupArguments { role, debug: false })
}

fn prompt_line(prompt: &str) -> io::Result<String> {
    use std::io::{BufRead, Write};

    print!("{prompt}");
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    if line.is_empty() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stdin closed"));
    }

    Ok(line)
}

fn prompt_port(prompt: &str) -> io::Result<u16> {
    loop {
        let raw = prompt_line(prompt)?;
        match raw.trim().parse::<u16>() {
            Ok(port) if port != 0 => return Ok(port),
            _ => println!("Invalid port number, must be 1 to 65535"),
        }
    }
}

fn init_logging(debug: bool) {
    let default_level = match debug {
        true => "debug",
        false => "info",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();
}

async fn async_main(startup_args: StartupArguments) -> io::Result<()> {
    // Root token, cancelled on Ctrl+C.
    let token = CancellationToken::new();

    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            signal_token.cancel();
        }
    });

    match startup_args.role {
        StartupRole::Host(config) => run_host(token, config).await?,
        StartupRole::Client(config) => run_client(token, config).await?,
    }

    info!("tunnel closed");
    Ok(())
}

async fn run_host(token: CancellationToken, config: HostConfig) -> io::Result<()> {
    let (quic, tr) = signaling::establish_as_host(&token, config.ws_bind_addr()).await?;
    stats::start_reporter(tr.done());

    let target = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, config.target_port));
    info!("P2P tunnel established — forwarding traffic to {target}");

    tunnel::run_as_host(Arc::clone(&tr), target).await?;

    tr.close();
    quic.wait_idle().await;
    Ok(())
}

async fn run_client(token: CancellationToken, config: ClientConfig) -> io::Result<()> {
    let (quic, tr) = signaling::establish_as_client(&token, &config.ws_url).await?;
    stats::start_reporter(tr.done());

    let listen_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, config.local_port));
    info!("P2P tunnel established — forwarding {listen_addr} to the host");

    tunnel::run_as_client(Arc::clone(&tr), listen_addr).await?;

    tr.close();
    quic.wait_idle().await;
    Ok(())
}
