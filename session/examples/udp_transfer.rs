//! Transfer a generated object between two UDP sockets on localhost.
//!
//! Run with:
//!
//! ```text
//! cargo run --example udp_transfer
//! ```

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use lot_session::{
    BlockDelivery, SessionConfig, SessionEvent, SessionManager, TransferParams, UdpTransport,
};
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lot_session=debug".into()),
        )
        .init();

    let near = UdpTransport::connect("127.0.0.1:9710".parse()?, "127.0.0.1:9711".parse()?).await?;
    let far = UdpTransport::connect("127.0.0.1:9711".parse()?, "127.0.0.1:9710".parse()?).await?;

    let sender = SessionManager::new(Arc::new(near), SessionConfig::default());
    let receiver = SessionManager::new(Arc::new(far), SessionConfig::default());

    let (send_events, _) = mpsc::unbounded_channel();
    let send_handle = sender.create(send_events)?;

    let (recv_events, mut events) = mpsc::unbounded_channel();
    let recv_handle = receiver.create(recv_events)?;

    let object = Bytes::from((0..1_000_000u32).map(|i| i as u8).collect::<Vec<u8>>());
    let expected = object.clone();

    let send_task = tokio::spawn(async move {
        sender
            .send(
                send_handle,
                object,
                TransferParams {
                    block_size: Some(1_200),
                    window_size: Some(32),
                    ..Default::default()
                },
            )
            .await
    });

    // wait for the announcement, then accept into a fresh buffer
    let object_size = loop {
        match events.recv().await {
            Some(SessionEvent::Receive { object_size, .. }) => break object_size,
            Some(other) => tracing::debug!(?other, "event before announcement"),
            None => anyhow::bail!("event channel closed"),
        }
    };

    let (block_tx, mut blocks) = mpsc::unbounded_channel::<BlockDelivery>();
    let progress = tokio::spawn(async move {
        let mut received = 0u64;
        while let Some(delivery) = blocks.recv().await {
            received += delivery.data.len() as u64;
            tracing::debug!(offset = delivery.offset, received, "block accepted");
        }
    });

    let assembled = receiver
        .receive(
            recv_handle,
            BytesMut::with_capacity(object_size as usize),
            block_tx,
            TransferParams::default(),
        )
        .await?;

    send_task.await??;
    progress.await?;

    anyhow::ensure!(assembled == expected, "object corrupted in transit");
    tracing::info!(size = assembled.len(), "transfer complete");
    Ok(())
}
