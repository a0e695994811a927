//! Ciphered relays
//!
//! The client side of every relay carries ciphered (and optionally
//! WebSocket-framed) bytes; the target side carries plain bytes.

use super::{IoConfig, TunnelError, WsDecoder, WsFrame, COALESCE_WINDOW};
use crate::crypto::{Cipher, KeyStream, Label};
use crate::transport::SessionObserver;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::io;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// The IO layer shared by every relay of a server
pub struct Relay {
    cipher: Arc<Cipher>,
    observer: OnceLock<Arc<dyn SessionObserver>>,
}

impl Relay {
    pub fn new(cipher: Arc<Cipher>) -> Self {
        Self {
            cipher,
            observer: OnceLock::new(),
        }
    }

    /// Install session bookkeeping; only the first call takes effect
    pub fn set_observer(&self, observer: Arc<dyn SessionObserver>) {
        let _ = self.observer.set(observer);
    }

    /// Relay between the client connection and the target until either ends
    ///
    /// Bytes from the client are deciphered with the upstream keystream,
    /// bytes to the client are ciphered with the downstream keystream. Both
    /// connections are shut down before returning.
    pub async fn bridge<D, T>(
        &self,
        downstream: D,
        target: T,
        iv: &[u8],
        ioc: IoConfig,
    ) -> Result<(u64, u64), TunnelError>
    where
        D: AsyncRead + AsyncWrite + Unpin,
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let up_ks = self.cipher.stream(Label::Upstream, iv).ok_or(TunnelError::InvalidIv)?;
        let down_ks = self
            .cipher
            .stream(Label::Downstream, iv)
            .ok_or(TunnelError::InvalidIv)?;

        if let Some(observer) = self.observer.get() {
            observer.on_open();
        }

        let (mut down_read, mut down_write) = tokio::io::split(downstream);
        let (mut target_read, mut target_write) = tokio::io::split(target);

        // Wait for either direction to complete
        let result = tokio::select! {
            r = pump_up(&mut down_read, &mut target_write, up_ks, &ioc) => r.map(|n| (n, 0)),
            r = pump_down(&mut target_read, &mut down_write, down_ks, &ioc) => r.map(|n| (0, n)),
        };

        target_write.shutdown().await.ok();
        down_write.shutdown().await.ok();

        if let Some(observer) = self.observer.get() {
            observer.on_close();
        }

        trace!(?result, "bridge finished");
        Ok(result?)
    }

    /// Cipher a body stream onto `writer` with the downstream keystream
    pub async fn copy<W, S>(
        &self,
        writer: &mut W,
        mut body: S,
        iv: &[u8],
        ioc: IoConfig,
    ) -> Result<u64, TunnelError>
    where
        W: AsyncWrite + Unpin,
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let mut ks = self
            .cipher
            .stream(Label::Downstream, iv)
            .ok_or(TunnelError::InvalidIv)?;
        let mut total = 0u64;

        while let Some(chunk) = body.next().await {
            let mut chunk = chunk?.to_vec();
            ks.xor_in_place(&mut chunk);
            if let Some(bucket) = &ioc.bucket {
                bucket.consume(chunk.len()).await;
            }
            writer.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }

        writer.flush().await?;
        Ok(total)
    }
}

/// Client to target
async fn pump_up<R, W>(
    reader: &mut R,
    writer: &mut W,
    mut ks: KeyStream,
    ioc: &IoConfig,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; ioc.chunk_size()];
    let mut decoder = ioc.websocket.then(WsDecoder::new);
    let mut total = 0u64;

    loop {
        let n = read_chunk(reader, &mut buf, ioc.partial).await?;
        if n == 0 {
            return Ok(total);
        }

        let Some(decoder) = decoder.as_mut() else {
            total += forward(writer, &mut buf[..n], &mut ks, ioc).await?;
            continue;
        };

        decoder.extend(&buf[..n]);
        while let Some(frame) = decoder
            .next_frame()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        {
            if frame.opcode.is_data() {
                let mut payload = frame.payload.to_vec();
                total += forward(writer, &mut payload, &mut ks, ioc).await?;
            } else if frame.opcode == super::OpCode::Close {
                debug!("websocket close from client");
                return Ok(total);
            }
        }
    }
}

/// Target to client
async fn pump_down<R, W>(
    reader: &mut R,
    writer: &mut W,
    mut ks: KeyStream,
    ioc: &IoConfig,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; ioc.chunk_size()];
    let mut total = 0u64;

    loop {
        let n = read_chunk(reader, &mut buf, ioc.partial).await?;
        if n == 0 {
            if ioc.websocket {
                writer.write_all(&WsFrame::close().encode(None)).await.ok();
            }
            return Ok(total);
        }

        ks.xor_in_place(&mut buf[..n]);
        if let Some(bucket) = &ioc.bucket {
            bucket.consume(n).await;
        }

        if ioc.websocket {
            let frame = WsFrame::binary(Bytes::copy_from_slice(&buf[..n]));
            writer.write_all(&frame.encode(None)).await?;
        } else {
            writer.write_all(&buf[..n]).await?;
        }
        writer.flush().await?;
        total += n as u64;
    }
}

async fn forward<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &mut [u8],
    ks: &mut KeyStream,
    ioc: &IoConfig,
) -> io::Result<u64> {
    ks.xor_in_place(data);
    if let Some(bucket) = &ioc.bucket {
        bucket.consume(data.len()).await;
    }
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(data.len() as u64)
}

/// Read once; unless `partial`, keep reading briefly to fill `buf`
async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    partial: bool,
) -> io::Result<usize> {
    let mut n = reader.read(buf).await?;
    if partial || n == 0 {
        return Ok(n);
    }

    while n < buf.len() {
        match tokio::time::timeout(COALESCE_WINDOW, reader.read(&mut buf[n..])).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(m)) => n += m,
            // Deliver what we have; the error resurfaces on the next read
            Ok(Err(_)) => break,
        }
    }
    Ok(n)
}
