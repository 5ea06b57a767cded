use clap::{Parser, Subcommand};
use portalloc_common::{
    AllocateRequest, AllocationError, AvailabilityResponse, BatchAllocateRequest, PortAllocation, PortBinding,
    RangeResponse, ReleaseOwnerRequest, ReleaseRequest,
};
use reqwest::{Client, Response};
use std::process::{Command, Stdio};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Base URL of the allocation daemon
    #[arg(long, env = "PORTALLOC_URL", default_value = "http://localhost:3030", global = true)]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Allocate a single port
    Alloc {
        server_id: i64,
        port: i64,
        /// TCP or UDP
        protocol: String,
        owner_id: i64,
    },
    /// Allocate several ports at once, all or nothing
    Batch {
        server_id: i64,
        owner_id: i64,
        /// Bindings as HOST_PORT/PROTOCOL[:CONTAINER_PORT], e.g. 27015/UDP:27015
        #[arg(required = true, value_parser = parse_binding)]
        bindings: Vec<PortBinding>,
    },
    /// Release an allocated port
    Release {
        server_id: i64,
        port: i64,
        protocol: String,
    },
    /// Release every port held by an owner
    ReleaseOwner {
        owner_id: i64,
    },
    /// Show who holds a port
    Get {
        server_id: i64,
        port: i64,
        protocol: String,
    },
    /// Check whether a port is free
    Check {
        server_id: i64,
        port: i64,
        protocol: String,
    },
    /// List allocations on a server
    List {
        server_id: i64,
    },
    /// List allocations held by an owner
    Owned {
        owner_id: i64,
    },
    /// Find free ports in a range
    Range {
        server_id: i64,
        protocol: String,
        start: i64,
        end: i64,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Run a command with allocated ports, releasing them when it exits
    Run {
        server_id: i64,
        owner_id: i64,

        /// Bindings as HOST_PORT/PROTOCOL[:CONTAINER_PORT]
        #[arg(long = "bind", required = true, value_parser = parse_binding)]
        bindings: Vec<PortBinding>,

        /// Environment variable for the first port; `<NAME>S` gets all of them (default: PORT)
        #[arg(long, default_value = "PORT")]
        env_name: String,

        /// Command and arguments to execute
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

fn parse_binding(s: &str) -> Result<PortBinding, String> {
    let (host, container) = match s.split_once(':') {
        Some((host, container)) => (host, Some(container)),
        None => (s, None),
    };
    let (port, protocol) = host
        .split_once('/')
        .ok_or_else(|| format!("expected HOST_PORT/PROTOCOL, got `{}`", s))?;
    let port = port
        .parse::<i64>()
        .map_err(|e| format!("bad host port `{}`: {}", port, e))?;

    let mut binding = PortBinding::new(port, protocol);
    if let Some(container) = container {
        let container = container
            .parse::<i64>()
            .map_err(|e| format!("bad container port `{}`: {}", container, e))?;
        binding = binding.with_container_port(container);
    }
    Ok(binding)
}

/// Pass a successful response through; otherwise print the daemon's error and exit.
async fn expect_success(resp: Response, action: &str) -> Response {
    let status = resp.status();
    if status.is_success() {
        return resp;
    }
    match resp.json::<AllocationError>().await {
        Ok(err) => eprintln!("Failed to {}: {}", action, err),
        Err(_) => eprintln!("Failed to {}: {}", action, status),
    }
    std::process::exit(1)
}

fn print_allocation(allocation: &PortAllocation) {
    println!(
        "Server: {}, Port: {}/{}, Owner: {}, Since: {}",
        allocation.server_id,
        allocation.port,
        allocation.protocol,
        allocation.owner_id,
        allocation.allocated_at.to_rfc3339()
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = cli.url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Alloc { server_id, port, protocol, owner_id } => {
            let req = AllocateRequest { server_id, port, protocol, owner_id };
            let resp = client.post(format!("{}/alloc", base_url))
                .json(&req)
                .send()
                .await?;

            let resp = expect_success(resp, "allocate port").await;
            let allocation: PortAllocation = resp.json().await?;
            print_allocation(&allocation);
        }
        Commands::Batch { server_id, owner_id, bindings } => {
            let req = BatchAllocateRequest { server_id, bindings, owner_id };
            let resp = client.post(format!("{}/alloc/batch", base_url))
                .json(&req)
                .send()
                .await?;

            let resp = expect_success(resp, "allocate ports").await;
            let allocations: Vec<PortAllocation> = resp.json().await?;
            for allocation in &allocations {
                print_allocation(allocation);
            }
        }
        Commands::Release { server_id, port, protocol } => {
            let req = ReleaseRequest { server_id, port, protocol: protocol.clone() };
            let resp = client.post(format!("{}/release", base_url))
                .json(&req)
                .send()
                .await?;

            expect_success(resp, "release port").await;
            println!("Released port: {}/{} on server {}", port, protocol, server_id);
        }
        Commands::ReleaseOwner { owner_id } => {
            let resp = client.post(format!("{}/release/owner", base_url))
                .json(&ReleaseOwnerRequest { owner_id })
                .send()
                .await?;

            expect_success(resp, "release ports").await;
            println!("Released all ports for owner {}", owner_id);
        }
        Commands::Get { server_id, port, protocol } => {
            let resp = client.get(format!("{}/allocation", base_url))
                .query(&[("server_id", server_id.to_string()), ("port", port.to_string()), ("protocol", protocol)])
                .send()
                .await?;

            let resp = expect_success(resp, "look up port").await;
            let allocation: PortAllocation = resp.json().await?;
            print_allocation(&allocation);
        }
        Commands::Check { server_id, port, protocol } => {
            let resp = client.get(format!("{}/available", base_url))
                .query(&[("server_id", server_id.to_string()), ("port", port.to_string()), ("protocol", protocol)])
                .send()
                .await?;

            let resp = expect_success(resp, "check port").await;
            let availability: AvailabilityResponse = resp.json().await?;
            if availability.available {
                println!("available");
            } else {
                println!("allocated");
                std::process::exit(1);
            }
        }
        Commands::List { server_id } => {
            let resp = client.get(format!("{}/list", base_url))
                .query(&[("server_id", server_id)])
                .send()
                .await?;

            let resp = expect_success(resp, "list allocations").await;
            let allocations: Vec<PortAllocation> = resp.json().await?;
            println!("Allocations on server {}:", server_id);
            for allocation in &allocations {
                print_allocation(allocation);
            }
        }
        Commands::Owned { owner_id } => {
            let resp = client.get(format!("{}/owner", base_url))
                .query(&[("owner_id", owner_id)])
                .send()
                .await?;

            let resp = expect_success(resp, "list allocations").await;
            let allocations: Vec<PortAllocation> = resp.json().await?;
            println!("Allocations for owner {}:", owner_id);
            for allocation in &allocations {
                print_allocation(allocation);
            }
        }
        Commands::Range { server_id, protocol, start, end, limit } => {
            let resp = client.get(format!("{}/range", base_url))
                .query(&[
                    ("server_id", server_id.to_string()),
                    ("protocol", protocol),
                    ("start", start.to_string()),
                    ("end", end.to_string()),
                    ("limit", limit.to_string()),
                ])
                .send()
                .await?;

            let resp = expect_success(resp, "scan range").await;
            let range: RangeResponse = resp.json().await?;
            for port in range.ports {
                println!("{}", port);
            }
        }
        Commands::Run { server_id, owner_id, bindings, env_name, command } => {
            if command.is_empty() {
                eprintln!("No command specified");
                std::process::exit(1);
            }

            let ports: Vec<String> = bindings.iter().map(|b| b.host_port.to_string()).collect();
            let req = BatchAllocateRequest { server_id, bindings, owner_id };
            let resp = client.post(format!("{}/alloc/batch", base_url))
                .json(&req)
                .send()
                .await?;

            expect_success(resp, "allocate ports").await;
            println!("Allocated ports {} for owner {}", ports.join(","), owner_id);

            let cmd = &command[0];
            let args = &command[1..];

            println!("Running: {} {:?} with {}={}", cmd, args, env_name, ports[0]);

            let status = Command::new(cmd)
                .args(args)
                .env(&env_name, &ports[0])
                .env(format!("{}S", env_name), ports.join(","))
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status();

            // Session teardown: drop everything this owner holds.
            let _ = client.post(format!("{}/release/owner", base_url))
                .json(&ReleaseOwnerRequest { owner_id })
                .send()
                .await;
            println!("Released ports for owner {}", owner_id);

            match status {
                Ok(s) => {
                    if !s.success() {
                        std::process::exit(s.code().unwrap_or(1));
                    }
                }
                Err(e) => {
                    eprintln!("Failed to run command: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
