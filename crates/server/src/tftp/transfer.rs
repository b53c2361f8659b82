//! One read transfer, driven over its own ephemeral socket

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use super::packet::{ErrorCode, Packet, TransferOptions};

/// Retransmissions of a single packet before the transfer is abandoned
pub const MAX_RETRIES: usize = 5;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("peer did not acknowledge block {block} after {attempts} attempts")]
    Timeout { block: u16, attempts: usize },

    #[error("peer aborted transfer: {0}")]
    Aborted(String),
}

/// Counters reported when a transfer ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub datagrams_sent: u64,
    pub datagrams_acked: u64,
    pub duration: Duration,
}

pub struct Transfer {
    socket: UdpSocket,
    peer: SocketAddr,
    options: TransferOptions,
    stats: TransferStats,
    buf: Vec<u8>,
}

/// Read until `buf` is full or the source is exhausted
async fn fill_block<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

impl Transfer {
    pub fn new(socket: UdpSocket, peer: SocketAddr, options: TransferOptions) -> Self {
        Self {
            socket,
            peer,
            options,
            stats: TransferStats::default(),
            buf: vec![0; 4 + super::packet::MAX_BLOCK_SIZE],
        }
    }

    /// Send an error packet to the peer, best effort
    pub async fn fail(&self, code: ErrorCode, message: &str) {
        let packet = Packet::error(code, message).encode();
        if let Err(e) = self.socket.send_to(&packet, self.peer).await {
            debug!(remote = %self.peer, error = %e, "cannot send error packet");
        }
    }

    /// Stream `source` to the peer.
    pub async fn run<R: AsyncRead + Unpin>(
        mut self,
        mut source: R,
    ) -> Result<TransferStats, TransferError> {
        let started = Instant::now();

        if !self.options.acknowledged.is_empty() {
            let oack = Packet::OptionAck(self.options.acknowledged.clone()).encode();
            self.exchange(&oack, 0).await?;
        }

        let mut block: u16 = 1;
        let mut data = vec![0u8; self.options.block_size];
        loop {
            let n = fill_block(&mut source, &mut data).await?;
            let packet = Packet::Data {
                block,
                data: data[..n].to_vec(),
            }
            .encode();
            self.exchange(&packet, block).await?;

            // a short block, including an empty one, ends the transfer
            if n < self.options.block_size {
                break;
            }
            block = block.wrapping_add(1);
        }

        self.stats.duration = started.elapsed();
        Ok(self.stats)
    }

    /// Send `packet` and wait for the ACK of `block`, retransmitting on timeout.
    async fn exchange(&mut self, packet: &[u8], block: u16) -> Result<(), TransferError> {
        for _ in 0..=MAX_RETRIES {
            self.socket.send_to(packet, self.peer).await?;
            self.stats.datagrams_sent += 1;

            if self.await_ack(block).await? {
                self.stats.datagrams_acked += 1;
                return Ok(());
            }
            debug!(remote = %self.peer, block, "retransmitting");
        }

        Err(TransferError::Timeout {
            block,
            attempts: MAX_RETRIES + 1,
        })
    }

    /// True once `block` is acknowledged, false on timeout. Duplicate ACKs
    /// of earlier blocks are ignored rather than answered.
    async fn await_ack(&mut self, block: u16) -> Result<bool, TransferError> {
        let deadline = tokio::time::Instant::now() + self.options.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let (len, from) = match timeout(remaining, self.socket.recv_from(&mut self.buf)).await {
                Ok(received) => received?,
                Err(_) => return Ok(false),
            };

            if from != self.peer {
                let stray = Packet::error(ErrorCode::UnknownTransferId, "unknown transfer id");
                let _ = self.socket.send_to(&stray.encode(), from).await;
                continue;
            }

            match Packet::parse(&self.buf[..len]) {
                Ok(Packet::Ack(acked)) if acked == block => return Ok(true),
                Ok(Packet::Ack(_)) => continue,
                Ok(Packet::Error { message, .. }) => return Err(TransferError::Aborted(message)),
                Ok(other) => {
                    debug!(remote = %self.peer, packet = ?other, "unexpected packet during transfer");
                }
                Err(e) => {
                    debug!(remote = %self.peer, error = %e, "malformed packet during transfer");
                }
            }
        }
    }
}
