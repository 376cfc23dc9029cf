use crate::client::{ClientConfig, TorrentClient};
use crate::error::Result;
use crate::session::{ProgressEvent, ProgressObserver};
use crate::torrent::{MetadataProvider, TorrentFile};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "peerwire")]
#[command(about = "A BitTorrent client written in Rust", long_about = None)]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download one or more torrents
    Download {
        /// Paths to the .torrent files
        #[arg(required = true)]
        torrents: Vec<PathBuf>,

        /// Download directory
        #[arg(short, long, default_value = "./downloads")]
        output: String,

        /// Port to listen on
        #[arg(short, long, default_value = "6881")]
        port: u16,

        /// Maximum number of peers per torrent
        #[arg(short, long, default_value = "50")]
        max_peers: usize,

        /// Upload cap per connection in KiB/s (0 = unlimited)
        #[arg(long, default_value = "0")]
        upload_limit: u64,

        /// Download cap per connection in KiB/s (0 = unlimited)
        #[arg(long, default_value = "0")]
        download_limit: u64,

        /// Keep seeding after the download completes
        #[arg(long)]
        seed: bool,

        /// Extra peer to connect to (repeatable)
        #[arg(long = "peer", value_name = "ADDR")]
        peers: Vec<SocketAddr>,
    },

    /// Show information about a torrent file
    Info {
        /// Path to the .torrent file
        torrent: PathBuf,
    },
}

/// Reports session progress through the log
struct LogProgress {
    name: String,
}

impl ProgressObserver for LogProgress {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Progress { num_done, total } => {
                info!("{}: {}/{} pieces", self.name, num_done, total)
            }
            ProgressEvent::RateUpdate {
                down_speed,
                up_speed,
            } => info!(
                "{}: down {:.1} KiB/s, up {:.1} KiB/s",
                self.name,
                down_speed / 1024.0,
                up_speed / 1024.0
            ),
            ProgressEvent::Completed => info!("{}: download complete", self.name),
            ProgressEvent::Saved => info!("{}: saved", self.name),
        }
    }
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Download {
                torrents,
                output,
                port,
                max_peers,
                upload_limit,
                download_limit,
                seed,
                peers,
            } => {
                let config = ClientConfig {
                    download_dir: output.clone(),
                    listen_port: *port,
                    max_peers: *max_peers,
                    upload_limit: upload_limit * 1024,
                    download_limit: download_limit * 1024,
                    seed: *seed,
                    peers: peers.clone(),
                };
                self.download(TorrentClient::new(config), torrents).await?;
            }

            Commands::Info { torrent } => {
                self.show_torrent_info(torrent).await?;
            }
        }

        Ok(())
    }

    async fn download(&self, client: TorrentClient, paths: &[PathBuf]) -> Result<()> {
        let mut sessions = Vec::new();
        for path in paths {
            let provider = TorrentFile::new(path);
            let name = path.display().to_string();
            let observer = Arc::new(LogProgress { name: name.clone() });
            match client.add_from(&provider, observer).await? {
                Some(session) => sessions.push((name, session)),
                None => warn!("Skipping duplicate torrent {}", name),
            }
        }

        info!("Running {} torrent(s)", client.torrent_count());
        let (_, listener) = client.listen().await?;

        let wait_all = async {
            let mut failed = None;
            for (name, session) in sessions.iter_mut() {
                match session.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("{}: {}", name, e);
                        failed.get_or_insert(e);
                    }
                    Err(e) => error!("{}: session task failed: {}", name, e),
                }
            }
            failed
        };
        tokio::pin!(wait_all);

        let failed = tokio::select! {
            failed = &mut wait_all => failed,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                client.stop_all();
                wait_all.await
            }
        };

        listener.abort();
        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn show_torrent_info(&self, torrent_path: &PathBuf) -> Result<()> {
        let metainfo = TorrentFile::new(torrent_path).metadata().await?;

        println!("Torrent Information");
        println!("==================");
        println!("Name: {}", metainfo.name);
        println!("Total Size: {} bytes", metainfo.total_length);
        println!("Piece Length: {} bytes", metainfo.piece_length);
        println!("Number of Pieces: {}", metainfo.num_pieces());
        println!("Info Hash: {}", metainfo.info_hash_hex());

        println!("\nTrackers:");
        for tracker in &metainfo.trackers {
            println!("  - {}", tracker);
        }

        println!("\nFiles:");
        for (i, file) in metainfo.files.iter().enumerate() {
            println!(
                "  {}: {} ({} bytes)",
                i + 1,
                file.path.join("/"),
                file.length
            );
        }

        Ok(())
    }
}
