use std::{net::IpAddr, path::PathBuf};

use clap::{Parser, Subcommand};
use svctunnel_core::{
    Settings,
    daemon_client::{DaemonClient, DaemonCommand, DaemonStatus, SocketDaemonClient},
    error::Result,
    logging,
};
use tokio::time::Duration;

#[derive(Parser)]
#[command(name = "svctunnel")]
#[command(about = "Control the WireGuard tunnel service daemon", long_about = None)]
struct Cli {
    /// INI file overriding the default paths and timeouts
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the tunnel up from a WireGuard client configuration
    Connect {
        #[arg(long)]
        config: PathBuf,
    },
    Disconnect,
    /// Take the tunnel down, keeping the connection parameters
    Pause,
    Resume,
    Dns {
        #[command(subcommand)]
        command: DnsCommands,
    },
    Status,
    Logs {
        #[arg(long, default_value_t = 64 * 1024)]
        max_bytes: u64,
    },
    Logging {
        #[command(subcommand)]
        command: LoggingCommands,
    },
}

#[derive(Subcommand)]
enum DnsCommands {
    /// Use this DNS server instead of the tunnel's own
    Set { ip: IpAddr },
    Reset,
}

#[derive(Subcommand)]
enum LoggingCommands {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_console();
    let cli = Cli::parse();
    let settings = match &cli.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::platform_default()?,
    };

    // The connect reply only comes once the service is running.
    let response_timeout = settings.timeouts.install + settings.timeouts.start + Duration::from_secs(60);
    let client = SocketDaemonClient::new(&settings.paths.socket, response_timeout);

    let command = match cli.command {
        Commands::Connect { config } => DaemonCommand::Connect {
            config_path: std::path::absolute(&config)?.display().to_string(),
        },
        Commands::Disconnect => DaemonCommand::Disconnect,
        Commands::Pause => DaemonCommand::Pause,
        Commands::Resume => DaemonCommand::Resume,
        Commands::Dns { command } => match command {
            DnsCommands::Set { ip } => DaemonCommand::SetManualDns { ip },
            DnsCommands::Reset => DaemonCommand::ResetManualDns,
        },
        Commands::Status => DaemonCommand::Status,
        Commands::Logs { max_bytes } => DaemonCommand::Logs { max_bytes },
        Commands::Logging { command } => DaemonCommand::SetLogging {
            enabled: matches!(command, LoggingCommands::On),
        },
    };
    let is_status = command == DaemonCommand::Status;

    let message = client.send_command(command).await?.into_result()?;
    if is_status {
        print_status(&serde_json::from_str(&message)?);
    } else {
        println!("{}", message);
    }
    Ok(())
}

fn print_status(status: &DaemonStatus) {
    match (&status.service_name, status.tunnel_state) {
        (Some(service_name), Some(state)) => println!("{service_name}: {state:?}"),
        _ => println!("No tunnel"),
    }
    if let Some(event) = &status.last_event {
        print!("Last event: {:?}", event.state);
        if let (Some(client_ip), Some(host_ip)) = (event.client_ip, event.host_ip) {
            print!(" ({client_ip} -> {host_ip})");
        }
        if let Some(reason) = &event.reason {
            print!(": {reason}");
        }
        println!();
    }
    if let Some(manual_dns) = status.manual_dns {
        println!("Manual DNS: {manual_dns}");
    }
}
