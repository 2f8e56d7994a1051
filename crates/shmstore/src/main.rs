//! shmstore command-line tool
//!
//! Runs a store with its manager, or talks to a running one.

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use denc::ObjectId;
use futures::StreamExt;
use objstore::{server, Manager, PeerAddr, Store};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use storeclient::{load_client_options, ObjectStoreClient};
use storeconfig::{ConfigValue, ManagerOptions, Size, StoreConfig, StoreOptions};
use tokio::net::UnixListener;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shmstore")]
#[command(about = "Shared-memory object store", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(
        short = 'c',
        long,
        env = "SHMSTORE_CONF",
        default_value = "/etc/shmstore/shmstore.conf"
    )]
    conf: String,

    /// Store socket
    /// If not specified, will be read from the configuration file
    #[arg(long, env = "SHMSTORE_STORE_SOCKET")]
    store_socket: Option<String>,

    /// Manager socket
    /// If not specified, will be read from the configuration file
    #[arg(long, env = "SHMSTORE_MANAGER_SOCKET")]
    manager_socket: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a store and its manager until interrupted
    Serve {
        /// Store capacity (e.g. "512M", "4G")
        #[arg(long)]
        capacity: Option<String>,
        /// Address the manager advertises
        #[arg(long)]
        address: Option<String>,
        /// Port the manager advertises
        #[arg(long)]
        port: Option<u16>,
        /// Peer store as address:port=socket (repeatable; adds to the
        /// configured peers)
        #[arg(long = "peer")]
        peers: Vec<String>,
    },
    /// Store an object read from a file or stdin
    Put {
        /// Input file ("-" for stdin)
        file: String,
        /// Object id in hex; derived from the content if omitted
        #[arg(long)]
        id: Option<String>,
        /// Metadata stored next to the data
        #[arg(long, default_value = "")]
        metadata: String,
    },
    /// Write an object's data to a file or stdout
    Get {
        /// Object id in hex
        object: String,
        /// Output file ("-" for stdout)
        file: String,
        /// Milliseconds to wait for the object to be sealed (-1 waits forever)
        #[arg(long, default_value = "0", allow_negative_numbers = true)]
        timeout_ms: i64,
    },
    /// Check whether an object is sealed in the store
    Contains {
        /// Object id in hex
        object: String,
    },
    /// Print the SHA-256 of an object's data and metadata
    Hash {
        /// Object id in hex
        object: String,
    },
    /// Delete an object
    Delete {
        /// Object id in hex
        object: String,
    },
    /// Free at least the given number of bytes
    Evict {
        /// Bytes to free (e.g. "100M")
        bytes: String,
    },
    /// Wait until some objects are available locally or on a peer
    Wait {
        /// Object ids in hex
        #[arg(required = true)]
        objects: Vec<String>,
        /// How many objects must be available
        #[arg(short = 'n', long, default_value = "1")]
        num_returns: usize,
        /// Milliseconds to wait
        #[arg(long, default_value = "1000")]
        timeout_ms: u64,
    },
    /// Ask the manager to pull objects from peers
    Fetch {
        /// Object ids in hex
        #[arg(required = true)]
        objects: Vec<String>,
    },
    /// Push an object to the store behind another manager
    Transfer {
        /// Object id in hex
        object: String,
        /// Peer address
        address: String,
        /// Peer port
        port: u16,
    },
    /// Print lifecycle notifications
    Watch {
        /// Print one JSON document per event
        #[arg(long)]
        json: bool,
        /// Stop after this many events
        #[arg(long)]
        count: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; --debug only changes the default
    let default_level = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let conf = Path::new(&cli.conf);
    let conf = if conf.exists() {
        debug!("Loading configuration from: {}", cli.conf);
        Some(conf)
    } else {
        debug!("Configuration file not found: {}", cli.conf);
        None
    };

    if let Commands::Serve {
        capacity,
        address,
        port,
        peers,
    } = &cli.command
    {
        let config = conf
            .map(StoreConfig::from_file)
            .transpose()
            .context("Failed to parse configuration file")?;
        let serve_args = ServeArgs {
            capacity: capacity.as_deref(),
            address: address.as_deref(),
            port: *port,
            peers,
        };
        return serve(&cli, config.as_ref(), serve_args).await;
    }

    let mut options = load_client_options(conf).context("Invalid client configuration")?;
    if let Some(path) = &cli.store_socket {
        options.store_socket = path.clone();
    }
    if let Some(path) = &cli.manager_socket {
        options.manager_socket = path.clone();
    }
    // A one-shot command must not leave releases queued
    options.release_delay.0 = 0;

    info!("Connecting to store at {}", options.store_socket);
    let client = ObjectStoreClient::connect(&options)
        .await
        .with_context(|| format!("Failed to connect to {}", options.store_socket))?;

    run(&client, cli.command, cli.debug).await?;
    client.disconnect().await.context("Failed to disconnect")?;
    Ok(())
}

async fn run(client: &ObjectStoreClient, command: Commands, verbose: bool) -> Result<()> {
    match command {
        Commands::Serve { .. } => bail!("serve runs a store; it does not connect to one"),
        Commands::Put { file, id, metadata } => {
            let data = read_input(&file).context("Failed to read input")?;
            let object_id = match id {
                Some(id) => parse_id(&id)?,
                None => ObjectId::from_content(&data),
            };
            let mut buffer = client
                .create(object_id, data.len(), Bytes::from(metadata))
                .await
                .context("Failed to create object")?;
            buffer.copy_from_slice(&data);
            client.seal(buffer).await.context("Failed to seal object")?;
            client
                .release(object_id)
                .await
                .context("Failed to release object")?;

            println!("{}", object_id);
            if verbose {
                eprintln!("Wrote {} bytes to {}", data.len(), object_id);
            }
        }
        Commands::Get {
            object,
            file,
            timeout_ms,
        } => {
            let object_id = parse_id(&object)?;
            let timeout = u64::try_from(timeout_ms).ok().map(Duration::from_millis);
            let view = client
                .get(&[object_id], timeout)
                .await
                .context("Failed to get object")?
                .pop()
                .flatten()
                .ok_or_else(|| anyhow!("Object {} is not available", object_id))?;

            write_output(&file, view.data()).context("Failed to write output")?;
            client
                .release(object_id)
                .await
                .context("Failed to release object")?;

            if verbose {
                eprintln!(
                    "Read {} bytes ({} metadata) from {}",
                    view.data_size(),
                    view.metadata_size(),
                    object_id
                );
            }
        }
        Commands::Contains { object } => {
            let object_id = parse_id(&object)?;
            let present = client
                .contains(object_id)
                .await
                .context("Failed to query object")?;
            println!("{} {}", object_id, present);
        }
        Commands::Hash { object } => {
            let object_id = parse_id(&object)?;
            let digest = client
                .hash(object_id)
                .await
                .context("Failed to hash object")?
                .ok_or_else(|| anyhow!("Object {} is not sealed", object_id))?;
            println!("{} {}", digest.to_hex(), object_id);
        }
        Commands::Delete { object } => {
            let object_id = parse_id(&object)?;
            client
                .delete(object_id)
                .await
                .context("Failed to delete object")?;
            if verbose {
                eprintln!("Deleted {}", object_id);
            }
        }
        Commands::Evict { bytes } => {
            let Size(num_bytes) = Size::parse_config_value(&bytes)
                .with_context(|| format!("Invalid size '{}'", bytes))?;
            let freed = client.evict(num_bytes).await.context("Failed to evict")?;
            println!("{}", freed);
        }
        Commands::Wait {
            objects,
            num_returns,
            timeout_ms,
        } => {
            let ids = parse_ids(&objects)?;
            let (ready, remaining) = client
                .wait(&ids, num_returns, Duration::from_millis(timeout_ms))
                .await
                .context("Wait failed")?;
            // Keep the caller's order in the output
            for object_id in &ids {
                if ready.contains(object_id) {
                    println!("{} ready", object_id);
                } else if remaining.contains(object_id) {
                    println!("{} remaining", object_id);
                }
            }
        }
        Commands::Fetch { objects } => {
            let ids = parse_ids(&objects)?;
            client.fetch(&ids).await.context("Fetch failed")?;
        }
        Commands::Transfer {
            object,
            address,
            port,
        } => {
            let object_id = parse_id(&object)?;
            client
                .transfer(&address, port, object_id)
                .await
                .context("Transfer failed")?;
            if verbose {
                eprintln!("Transferred {} to {}:{}", object_id, address, port);
            }
        }
        Commands::Watch { json, count } => {
            let events = client
                .subscribe()
                .await
                .context("Failed to subscribe")?
                .into_stream();
            let mut events = Box::pin(events.take(count.unwrap_or(usize::MAX)));
            while let Some(event) = events.next().await {
                let event = event.context("Notification stream failed")?;
                if json {
                    println!("{}", serde_json::to_string(&event)?);
                } else if event.is_deletion() {
                    println!("deleted {}", event.object_id);
                } else {
                    println!(
                        "sealed {} data {} metadata {}",
                        event.object_id, event.data_size, event.metadata_size
                    );
                }
            }
        }
    }
    Ok(())
}

/// Flags of the serve subcommand that override the configuration
struct ServeArgs<'a> {
    capacity: Option<&'a str>,
    address: Option<&'a str>,
    port: Option<u16>,
    peers: &'a [String],
}

async fn serve(cli: &Cli, config: Option<&StoreConfig>, args: ServeArgs<'_>) -> Result<()> {
    let (mut store_options, mut manager_options) = match config {
        Some(config) => (
            StoreOptions::try_from_store_config(config, StoreOptions::SECTIONS)
                .context("Invalid store options")?,
            ManagerOptions::try_from_store_config(config, ManagerOptions::SECTIONS)
                .context("Invalid manager options")?,
        ),
        None => (StoreOptions::default(), ManagerOptions::default()),
    };
    if let Some(capacity) = args.capacity {
        store_options.store_capacity = Size::parse_config_value(capacity)
            .with_context(|| format!("Invalid capacity '{}'", capacity))?;
    }
    if let Some(path) = &cli.store_socket {
        store_options.store_socket = path.clone();
    }
    if let Some(path) = &cli.manager_socket {
        manager_options.manager_socket = path.clone();
    }
    if let Some(address) = args.address {
        manager_options.manager_address = address.to_string();
    }
    let port = match args.port {
        Some(port) => port,
        None => u16::try_from(manager_options.manager_port.0)
            .with_context(|| format!("Invalid manager port {}", manager_options.manager_port.0))?,
    };

    let store = Store::from_options(&store_options);
    let manager = Manager::new(store.clone(), manager_options.manager_address.clone(), port);
    let mut peers = PeerAddr::parse_list(&manager_options.manager_peers)
        .context("Invalid manager peers")?;
    for peer in args.peers {
        peers.push(peer.parse().context("Invalid --peer")?);
    }
    for peer in &peers {
        info!(
            "Peer {}:{} at {}",
            peer.address,
            peer.port,
            peer.socket.display()
        );
        manager.add_remote_peer(peer);
    }
    let store_listener = bind(&store_options.store_socket)?;
    let manager_listener = bind(&manager_options.manager_socket)?;
    info!(
        "Serving {} bytes at {}, manager {} at {}",
        store.capacity(),
        store_options.store_socket,
        manager.endpoint(),
        manager_options.manager_socket
    );

    let (stop_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let mut store_stop = stop_tx.subscribe();
    let mut manager_stop = stop_tx.subscribe();
    let store_server = tokio::spawn(server::serve(
        store_listener,
        Arc::new(store),
        async move {
            let _ = store_stop.recv().await;
        },
    ));
    let manager_server = tokio::spawn(server::serve(
        manager_listener,
        Arc::new(manager),
        async move {
            let _ = manager_stop.recv().await;
        },
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for interrupt")?;
    info!("Interrupted, shutting down");
    let _ = stop_tx.send(());

    store_server
        .await
        .context("Store server panicked")?
        .context("Store server failed")?;
    manager_server
        .await
        .context("Manager server panicked")?
        .context("Manager server failed")?;

    for path in [&store_options.store_socket, &manager_options.manager_socket] {
        if let Err(e) = std::fs::remove_file(path) {
            debug!("Failed to remove {}: {}", path, e);
        }
    }
    Ok(())
}

/// Listen on `path`, replacing a socket left behind by an earlier run
fn bind(path: &str) -> Result<UnixListener> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    if path.exists() {
        debug!("Removing stale socket {}", path.display());
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("Failed to bind {}", path.display()))
}

fn parse_id(s: &str) -> Result<ObjectId> {
    s.parse()
        .with_context(|| format!("Invalid object id '{}'", s))
}

fn parse_ids(ids: &[String]) -> Result<Vec<ObjectId>> {
    if ids.is_empty() {
        bail!("No object ids given");
    }
    ids.iter().map(|s| parse_id(s)).collect()
}

/// Read input from file or stdin
fn read_input(file: &str) -> Result<Bytes> {
    let data = if file == "-" {
        let mut buffer = Vec::new();
        io::stdin()
            .read_to_end(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        std::fs::read(file).context(format!("Failed to read file: {}", file))?
    };

    Ok(Bytes::from(data))
}

/// Write output to file or stdout
fn write_output(file: &str, data: &[u8]) -> Result<()> {
    if file == "-" {
        io::stdout()
            .write_all(data)
            .context("Failed to write to stdout")?;
        io::stdout().flush().context("Failed to flush stdout")?;
    } else {
        std::fs::write(file, data).context(format!("Failed to write file: {}", file))?;
    }

    Ok(())
}
