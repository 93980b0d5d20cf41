//! Scatter/gather writes of queued payloads.
//!
//! Sends queued on a session lane are drained in batches and written with
//! `write_vectored`, so N small sends cost one syscall instead of N.

use std::io::{self, IoSlice};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Maximum payloads written in a single batch.
pub const MAX_BATCH_SIZE: usize = 64;

/// Write every payload of `batch` in order, then flush.
pub async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(Bytes::len).sum();
    if total_size == 0 {
        return Ok(());
    }

    let slices: Vec<IoSlice<'_>> = batch.iter().map(|b| IoSlice::new(b)).collect();

    // Fast path: the kernel took everything in one call.
    let mut total_written = writer.write_vectored(&slices).await?;
    if total_written == 0 {
        return Err(write_zero());
    }

    while total_written < total_size {
        let remaining = remaining_slices(batch, total_written);
        let written = writer.write_vectored(&remaining).await?;
        if written == 0 {
            return Err(write_zero());
        }
        total_written += written;
    }

    writer.flush().await
}

/// Slices covering everything after the first `skip_bytes` of `batch`.
fn remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for payload in batch {
        let end = offset + payload.len();
        if skip_bytes < end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&payload[start..]));
        }
        offset = end;
    }

    slices
}

fn write_zero() -> io::Error {
    io::Error::new(io::ErrorKind::WriteZero, "write_vectored returned 0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncReadExt};

    /// Writer accepting at most `limit` bytes per call.
    struct Trickle {
        out: Vec<u8>,
        limit: usize,
    }

    impl AsyncWrite for Trickle {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let n = buf.len().min(self.limit);
            self.out.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_batch_arrives_in_order() {
        let (mut client, mut server) = duplex(1024);
        let batch = vec![
            Bytes::from_static(b"one "),
            Bytes::from_static(b"two "),
            Bytes::from_static(b"three"),
        ];
        write_batch(&mut client, &batch).await.unwrap();
        drop(client);

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"one two three");
    }

    #[tokio::test]
    async fn test_partial_writes_resume() {
        let mut writer = Trickle {
            out: Vec::new(),
            limit: 3,
        };
        let batch = vec![Bytes::from_static(b"abcde"), Bytes::from_static(b"fghij")];
        write_batch(&mut writer, &batch).await.unwrap();
        assert_eq!(writer.out, b"abcdefghij");
    }

    #[tokio::test]
    async fn test_zero_write_is_error() {
        let mut writer = Trickle {
            out: Vec::new(),
            limit: 0,
        };
        let err = write_batch(&mut writer, &[Bytes::from_static(b"x")])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_remaining_slices_skip_into_payload() {
        let batch = vec![Bytes::from_static(b"abc"), Bytes::from_static(b"defg")];
        let slices = remaining_slices(&batch, 4);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"efg");

        let slices = remaining_slices(&batch, 1);
        assert_eq!(slices.len(), 2);
        assert_eq!(&*slices[0], b"bc");
    }
}
