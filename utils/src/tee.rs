use anyhow::{anyhow, Result};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::ByteStream;

/// Splits `source` into two independent streams that each observe every
/// chunk in order.
///
/// A pump task drives the source and buffers chunks per consumer, so a slow
/// or dropped consumer never stalls the other one. The pump stops early only
/// when both consumers are gone. A source error is delivered to both sides
/// and ends both streams.
pub fn tee(source: ByteStream) -> (ByteStream, ByteStream) {
    let (left_tx, left_rx) = mpsc::unbounded_channel();
    let (right_tx, right_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut source = source;
        while let Some(chunk) = source.next().await {
            match chunk {
                Ok(bytes) => {
                    let left_open = left_tx.send(Ok(bytes.clone())).is_ok();
                    let right_open = right_tx.send(Ok(bytes)).is_ok();
                    if !left_open && !right_open {
                        return;
                    }
                }
                Err(err) => {
                    let _ = left_tx.send(Err(anyhow!("{:#}", err)));
                    let _ = right_tx.send(Err(err));
                    return;
                }
            }
        }
    });

    (
        Box::pin(UnboundedReceiverStream::new(left_rx)),
        Box::pin(UnboundedReceiverStream::new(right_rx)),
    )
}

/// Reads a whole stream into memory.
pub async fn collect_bytes(mut stream: ByteStream) -> Result<Bytes> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buffer.extend_from_slice(&chunk?);
    }
    Ok(buffer.freeze())
}
