//! Byte pumps between SSH channels and local sockets

use anyhow::{Context, Result};
use russh::client::Msg;
use russh::Channel;
use tokio::net::TcpStream;

/// Pipe a forwarded channel into a fresh connection to `target`
pub(super) async fn deliver(channel: Channel<Msg>, target: &str) -> Result<()> {
    let local = TcpStream::connect(target)
        .await
        .with_context(|| format!("Failed to connect to {}", target))?;
    local.set_nodelay(true).ok();

    pipe(local, channel).await
}

/// Copy bytes both ways until either side closes
pub(super) async fn pipe(mut local: TcpStream, channel: Channel<Msg>) -> Result<()> {
    let mut remote = Box::pin(channel.into_stream());
    let (out, back) = tokio::io::copy_bidirectional(&mut local, &mut remote)
        .await
        .context("Forwarded stream failed")?;
    tracing::trace!("Forward closed ({} bytes out, {} bytes back)", out, back);
    Ok(())
}
