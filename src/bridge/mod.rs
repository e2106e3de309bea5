//! Pairs a [`Connection`] with a local byte stream.

use p2ptun_core::error::Error as CoreError;
use p2ptun_core::Connection;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::BridgeConfig;
use crate::error::Result;

/// Relay bytes both ways until either side ends, then close the connection and the stream.
///
/// End of stream and a peer CLOSE are normal endings and return `Ok`; read or write failures
/// are returned as errors after the same teardown.
pub async fn pass_through<S>(connection: Connection, stream: S, config: &BridgeConfig) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (mut read, mut write) = tokio::io::split(stream);
    let id = connection.id();
    let rs = tokio::select! {
        rs = stream_to_connection(&mut read, &connection, config.read_buffer_size) => rs,
        rs = connection_to_stream(&connection, &mut write) => rs,
    };
    connection.close();
    if let Err(e) = write.shutdown().await {
        log::debug!("connection {id}: shutdown local stream: {e:?}");
    }
    if let Err(e) = &rs {
        if !e.is_closed() {
            log::debug!("connection {id}: bridge ended with {e}");
        }
    }
    rs
}

async fn stream_to_connection<R>(read: &mut R, connection: &Connection, size: usize) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; size];
    loop {
        let len = read.read(&mut buf).await?;
        if len == 0 {
            log::debug!("connection {}: local stream eof", connection.id());
            return Ok(());
        }
        connection.send(&buf[..len]).await?;
    }
}

async fn connection_to_stream<W>(connection: &Connection, write: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let buf = match connection.read().await {
            Ok(buf) => buf,
            Err(CoreError::ConnectionClosed) => {
                log::debug!("connection {}: closed by peer", connection.id());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        write.write_all(&buf).await?;
    }
}
