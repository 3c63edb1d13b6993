//! Configuration for weftd

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use weft_core::PeerAddress;

/// A super peer: identity pinned to a public endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SuperPeerSpec {
    pub address: PeerAddress,
    pub endpoint: SocketAddr,
}

impl FromStr for SuperPeerSpec {
    type Err = String;

    /// Parses `<64-char-hex-address>@<host:port>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, endpoint) = s
            .split_once('@')
            .ok_or_else(|| "expected <address-hex>@<host:port>".to_string())?;
        let address = PeerAddress::from_hex(address).map_err(|e| e.to_string())?;
        let endpoint = endpoint
            .parse()
            .map_err(|e| format!("invalid endpoint: {e}"))?;
        Ok(Self { address, endpoint })
    }
}

/// weftd - weft overlay node daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "weftd")]
#[command(about = "weft overlay network node")]
pub struct Config {
    /// Listen address for the UDP endpoint
    #[arg(short, long, default_value = "0.0.0.0:22527")]
    pub listen: SocketAddr,

    /// Identity file, created on first start
    #[arg(short, long, default_value = "./weft.identity")]
    pub identity_file: PathBuf,

    /// Overlay network this node belongs to
    #[arg(long, env = "WEFT_NETWORK_ID", default_value = "1")]
    pub network_id: i32,

    /// Leading zero bits every proof of work must satisfy
    #[arg(long, default_value = "24")]
    pub pow_difficulty: u8,

    /// Super peers to join, comma-separated `<address-hex>@<host:port>`
    #[arg(long, value_delimiter = ',')]
    pub super_peer: Vec<SuperPeerSpec>,

    /// Accept join-as-child requests from other nodes
    #[arg(long)]
    pub accept_children: bool,

    /// Endpoints advertised to peers that join us
    #[arg(long, value_delimiter = ',')]
    pub advertise: Vec<SocketAddr>,

    /// Per-attempt handshake timeout in milliseconds
    #[arg(long, default_value = "5000")]
    pub handshake_timeout_ms: u64,

    /// Retry delays in milliseconds; the last one repeats
    #[arg(long, value_delimiter = ',', default_value = "500,1000,2000,5000")]
    pub retry_delays_ms: Vec<u64>,

    /// Inbound queue size at which a channel refuses messages
    #[arg(long, default_value = "64")]
    pub channel_high_watermark: usize,

    /// Inbound queue size at which a refusing channel recovers
    #[arg(long, default_value = "32")]
    pub channel_low_watermark: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.channel_low_watermark >= self.channel_high_watermark {
            anyhow::bail!("low watermark must be below the high watermark");
        }
        if self.pow_difficulty > 64 {
            anyhow::bail!("proof-of-work difficulty above 64 bits is not minable");
        }
        Ok(())
    }
}
