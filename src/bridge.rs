//! Prologix GPIB-Ethernet bridge.
//!
//! The bridge is a plain TCP byte pipe to the GPIB bus. Lines starting with `++` are
//! addressed to the bridge itself; everything else is forwarded to the selected
//! instrument. With `++auto 1` the bridge reads the instrument reply after every
//! forwarded line, so replies arrive unsolicited on the same socket, in arbitrary
//! chunks and without any framing of their own.
//!
//! ```text
//! ++addr 17\r*IDN?\r\n   ──>  bridge  ──>  GPIB 17
//! HP8751A\n              <──  bridge  <──
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace};

use crate::config::{BridgeConfig, MAX_GPIB_ADDRESS};
use crate::error::{AppResult, VnaError};

/// Bridge set-up written once after the TCP connection is established.
///
/// Controller mode, read-after-write, assert EOI with the last byte, no terminator
/// appended by the bridge, no extra character on EOI, then clear the bus.
pub const INIT_SEQUENCE: [&str; 6] = [
    "++mode 1",
    "++auto 1",
    "++eoi 1",
    "++eos 3",
    "++eot_enable 0",
    "++ifc",
];

/// Terminator of bridge commands.
const BRIDGE_TERMINATOR: &str = "\r";

/// Terminator of instrument commands.
const INSTRUMENT_TERMINATOR: &str = "\r\n";

/// State of the TCP link to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No connection
    #[default]
    Unconnected,
    /// TCP connect in progress
    Connecting,
    /// Link up and bridge initialized
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unconnected => write!(f, "Unconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

/// Addressing and wire format of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrologixBridge {
    gpib_address: u8,
}

impl PrologixBridge {
    /// Bridge talking to the instrument at `gpib_address`.
    pub fn new(gpib_address: u8) -> AppResult<Self> {
        if gpib_address > MAX_GPIB_ADDRESS {
            return Err(VnaError::Configuration(format!(
                "GPIB address {gpib_address} outside 0-{MAX_GPIB_ADDRESS}"
            )));
        }
        Ok(Self { gpib_address })
    }

    /// GPIB address of the instrument.
    pub fn gpib_address(&self) -> u8 {
        self.gpib_address
    }

    /// Bytes of the set-up sequence.
    pub fn init_bytes(&self) -> Vec<u8> {
        INIT_SEQUENCE
            .iter()
            .flat_map(|line| [*line, BRIDGE_TERMINATOR])
            .collect::<String>()
            .into_bytes()
    }

    /// Address prefix plus command text, as written to the socket.
    pub fn frame(&self, command: &str) -> Vec<u8> {
        format!(
            "++addr {}{BRIDGE_TERMINATOR}{command}{INSTRUMENT_TERMINATOR}",
            self.gpib_address
        )
        .into_bytes()
    }

    /// Write the set-up sequence.
    pub async fn initialize<W>(&self, writer: &mut W) -> AppResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        debug!("Initializing Prologix bridge");
        writer.write_all(&self.init_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Write one instrument command.
    pub async fn send<W>(&self, writer: &mut W, command: &str) -> AppResult<()>
    where
        W: AsyncWrite + Unpin,
    {
        trace!(address = self.gpib_address, command, "Writing to bus");
        writer.write_all(&self.frame(command)).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Open the TCP connection to the bridge.
pub async fn connect(config: &BridgeConfig) -> AppResult<TcpStream> {
    let addr = format!("{}:{}", config.host, config.port);
    info!(%addr, "Connecting to GPIB bridge");
    let stream = connect_with_timeout(&addr, config.connect_timeout).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn connect_with_timeout(addr: &str, timeout: Duration) -> AppResult<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(VnaError::Io(format!(
            "connection to {addr} timed out after {timeout:?}"
        ))),
    }
}
