use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Config {
    /// Local UDP endpoints for the DHT, one node per endpoint
    #[clap(long, value_parser, default_value = "0.0.0.0:28400")]
    pub dht_endpoint: Vec<SocketAddr>,

    /// TCP endpoint peers fetch cached responses from
    #[clap(long, value_parser, default_value = "0.0.0.0:28401")]
    pub serve_endpoint: SocketAddr,

    /// Directory holding cached responses and DHT state
    #[clap(long, value_parser, default_value = ".ouicache")]
    pub cache_dir: PathBuf,

    /// Base64 Ed25519 public key of the trusted cache signer
    #[clap(long, value_parser)]
    pub cache_key: Option<String>,

    /// Override the DHT bootstrap domains
    #[clap(long, value_parser)]
    pub bootstrap: Vec<String>,

    /// Announce stored entries on their uri swarms
    #[clap(long, value_parser, default_value_t = false)]
    pub announce: bool,
}

impl Config {
    pub fn new() -> Config {
        Config::parse()
    }
}
