mod cli;

use clap::Parser;
use cli::{Commands, NodeArgs, SearchArgs, ServentCli};
use servent_core::constants::{self, VERSION};
use servent_core::directory::{BootstrapDirectory, HttpDirectory};
use servent_core::error::Result;
use servent_core::peer::PeerCache;
use servent_core::servent::{DownloadOutcome, Servent};
use servent_core::transfer::SharedFolder;
use std::sync::Arc;
use std::time::Duration;

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = ServentCli::parse();

    let outcome = match cli.command {
        Commands::Run(args) => {
            constants::print_banner();
            run(args).await
        }
        Commands::Search(args) => search(args).await,
        Commands::Version => {
            println!("servent-node {}", VERSION);
            Ok(())
        }
    };
    if let Err(e) = outcome {
        log::error!("❌ {}", e);
        std::process::exit(1);
    }
}

/// Builds, starts and connects a servent from the command line.
async fn launch(args: &NodeArgs) -> Result<Arc<Servent>> {
    let config = args.config();
    std::fs::create_dir_all(&config.shared_folder)?;
    let cache = match &config.cache_path {
        Some(path) => PeerCache::load_or_default(path)?,
        None => PeerCache::new(),
    };
    log::info!("📇 {} cached peer(s)", cache.len());

    let transfer = Arc::new(SharedFolder::new(config.shared_folder.clone()));
    let servent = Servent::new(config.clone(), cache, transfer);
    servent.start().await?;

    for peer in &args.peers {
        if let Err(e) = servent.connect_to(peer.ip(), peer.port()).await {
            log::warn!("Cannot dial {}: {}", peer, e);
        }
    }

    if let Some(url) = &args.directory {
        let directory: Arc<dyn BootstrapDirectory> = Arc::new(HttpDirectory::new(url)?);
        match servent.bootstrap(Arc::clone(&directory)).await {
            Ok(added) => log::info!("📚 {} peer(s) imported from {}", added, url),
            Err(e) => log::warn!("Bootstrap from {} failed: {}", url, e),
        }
        if let Some(port) = config.api_port {
            let callback = format!("http://{}:{}/v1/signal", config.public_address, port);
            if let Err(e) = servent.subscribe(directory, &callback).await {
                log::warn!("Subscription to {} failed: {}", url, e);
            }
        }
    }
    Ok(servent)
}

async fn run(args: NodeArgs) -> Result<()> {
    let servent = launch(&args).await?;
    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => println!("{}", servent.status().await),
        }
    }
    servent.shutdown().await
}

async fn search(args: SearchArgs) -> Result<()> {
    let servent = launch(&args.node).await?;
    let wait = Duration::from_secs(args.wait);

    let deadline = tokio::time::Instant::now() + wait;
    while servent.connection_count().await == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    if servent.connection_count().await == 0 {
        log::warn!("No peer reachable, searching anyway");
    }

    let session = servent.search(&args.query).await;
    tokio::time::sleep(wait).await;
    let results = session.results().await;
    println!("{} result(s) for {:?}", results.len(), args.query);
    for (i, result) in results.iter().enumerate() {
        println!(
            "  [{}] {}  {}{}",
            i,
            result.file_name,
            result.source(),
            if result.firewalled { "  (firewalled)" } else { "" }
        );
    }

    if args.download {
        if let Some(first) = results.first() {
            match servent.download(first).await {
                Ok(DownloadOutcome::Fetched(bytes)) => println!("Downloaded {} ({} bytes)", first.file_name, bytes),
                Ok(DownloadOutcome::PushRequested(_)) => {
                    println!("Push requested for {}, waiting for the holder", first.file_name);
                    tokio::time::sleep(wait).await;
                }
                Err(e) => log::warn!("Download of {} failed: {}", first.file_name, e),
            }
        }
    }
    servent.stop_search(&session).await;
    servent.shutdown().await
}
