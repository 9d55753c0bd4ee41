// Shared fixtures for the end-to-end tests: a router on an ephemeral port
// and a raw-socket peer for driving the wire protocol directly.
#![allow(dead_code)]
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::BytesMut;
use syrinx_router::{Protocol, Router};
use syrinx_wire::{read_frame, write_frame, Packet, DEFAULT_MAX_FRAME_BYTES};
use tokio::net::TcpStream;

pub async fn start_router() -> Result<Router> {
    let mut router = Router::new();
    router.add_protocol("127.0.0.1:0", Protocol::tcp_xdr("127.0.0.1:0"));
    router.start().await.context("start router")?;
    Ok(router)
}

pub fn addr_of(router: &Router) -> SocketAddr {
    router.local_addr().expect("router listener address")
}

pub struct RawPeer {
    stream: TcpStream,
    scratch: BytesMut,
}

impl RawPeer {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.context("raw connect")?;
        Ok(Self {
            stream,
            scratch: BytesMut::with_capacity(4 * 1024),
        })
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        write_frame(&mut self.stream, &packet.encode())
            .await
            .context("raw send")?;
        Ok(())
    }

    /// Next inbound packet, or None on close.
    pub async fn recv(&mut self) -> Result<Option<Packet>> {
        let body = read_frame(&mut self.stream, &mut self.scratch, DEFAULT_MAX_FRAME_BYTES)
            .await
            .context("raw read")?;
        match body {
            Some(body) => Ok(Some(Packet::decode(body).context("raw decode")?)),
            None => Ok(None),
        }
    }

    pub async fn recv_within(&mut self, timeout: Duration) -> Result<Option<Packet>> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .context("raw read timeout")?
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

/// Poll the router's subscription table until it reaches `count` or a
/// second passes. Reaping runs just after an orderly disconnect returns,
/// so observers have to wait it out.
pub async fn wait_for_subscriptions(router: &Router, count: usize) {
    for _ in 0..100 {
        if router.subscription_count().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {count} subscriptions");
}

/// Poll the router's session table until it reaches `count`.
pub async fn wait_for_sessions(router: &Router, count: usize) {
    for _ in 0..100 {
        if router.session_count().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {count} sessions");
}
