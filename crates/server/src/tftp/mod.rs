//! Read-only TFTP service for network boot loaders
//!
//! Requests arrive on the well-known socket; each read is answered from a
//! fresh ephemeral socket so concurrent transfers never share state.

pub mod packet;
pub mod transfer;

use anyhow::{Context, Result};
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::boot::{BootResponse, BootService};
use packet::{ErrorCode, Packet, Request, TransferOptions};
use transfer::Transfer;

/// Largest request we accept on the main socket
const MAX_REQUEST_SIZE: usize = 2048;

pub struct TftpServer {
    socket: UdpSocket,
    boot: Arc<BootService>,
}

impl TftpServer {
    pub async fn bind(addr: &str, boot: Arc<BootService>) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind TFTP socket to {}", addr))?;
        Ok(Self { socket, boot })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("failed to get local address of TFTP socket")
    }

    /// Serve requests forever
    pub async fn run(self) -> Result<()> {
        info!(local_addr = %self.local_addr()?, "TFTP server listening");
        let mut buf = [0u8; MAX_REQUEST_SIZE];

        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "TFTP recv_from failed");
                    continue;
                }
            };

            match Packet::parse(&buf[..len]) {
                Ok(Packet::Read(request)) => {
                    let boot = self.boot.clone();
                    let bind_ip = self.local_addr()?.ip();
                    tokio::spawn(async move {
                        serve_read(boot, bind_ip, peer, request).await;
                    });
                }
                Ok(Packet::Write(request)) => {
                    info!(file = %request.filename, remote = %peer, "rejecting TFTP write");
                    self.reply(peer, Packet::error(ErrorCode::AccessViolation, "writing not supported"))
                        .await;
                }
                Ok(other) => {
                    debug!(remote = %peer, packet = ?other, "unexpected packet on TFTP port");
                    self.reply(peer, Packet::error(ErrorCode::IllegalOperation, "illegal operation"))
                        .await;
                }
                Err(e) => {
                    debug!(remote = %peer, error = %e, "malformed TFTP request");
                    self.reply(peer, Packet::error(ErrorCode::IllegalOperation, e.to_string()))
                        .await;
                }
            }
        }
    }

    async fn reply(&self, peer: SocketAddr, packet: Packet) {
        if let Err(e) = self.socket.send_to(&packet.encode(), peer).await {
            debug!(remote = %peer, error = %e, "cannot send TFTP reply");
        }
    }
}

async fn serve_read(boot: Arc<BootService>, bind_ip: std::net::IpAddr, peer: SocketAddr, request: Request) {
    let socket = match UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "cannot bind TFTP transfer socket");
            return;
        }
    };
    let file = request.filename.clone();

    if !request.mode_supported() {
        Transfer::new(socket, peer, TransferOptions::negotiate(&request, 0))
            .fail(ErrorCode::IllegalOperation, "unsupported transfer mode")
            .await;
        return;
    }

    let result = match boot.serve_path(&file).await {
        BootResponse::Script(script) => {
            let bytes = script.into_bytes();
            let options = TransferOptions::negotiate(&request, bytes.len() as u64);
            Transfer::new(socket, peer, options).run(Cursor::new(bytes)).await
        }
        BootResponse::File(path) => {
            let opened = match tokio::fs::File::open(&path).await {
                Ok(f) => f.metadata().await.map(|meta| (f, meta.len())),
                Err(e) => Err(e),
            };
            match opened {
                Ok((f, size)) => {
                    let options = TransferOptions::negotiate(&request, size);
                    Transfer::new(socket, peer, options).run(f).await
                }
                Err(e) => {
                    let transfer = Transfer::new(socket, peer, TransferOptions::negotiate(&request, 0));
                    transfer.fail(ErrorCode::FileNotFound, &e.to_string()).await;
                    Err(e.into())
                }
            }
        }
        BootResponse::NotFound(reason) => {
            Transfer::new(socket, peer, TransferOptions::negotiate(&request, 0))
                .fail(ErrorCode::FileNotFound, &reason)
                .await;
            info!(file = %file, remote = %peer, reason = %reason, "tftp file not found");
            return;
        }
    };

    match result {
        Ok(stats) => info!(
            file = %file,
            remote = %peer,
            duration_ms = stats.duration.as_millis() as u64,
            dsnt = stats.datagrams_sent,
            dack = stats.datagrams_acked,
            "tftp transfer complete"
        ),
        Err(e) => info!(
            file = %file,
            remote = %peer,
            error = %e,
            "tftp transfer failed"
        ),
    }
}
