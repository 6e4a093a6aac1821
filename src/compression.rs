//! Zlib stream compression (XEP-0138).
//!
//! Wraps a transport in a deflate/inflate pair. Every write ends with a zlib
//! sync flush so the peer can decode each element without waiting for more
//! data; the inflater keeps its dictionary across calls as the protocol
//! requires.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pin_project! {
    pub struct ZlibStream<S> {
        #[pin]
        inner: S,
        compress: Compress,
        decompress: Decompress,
        // Compressed bytes read from the wire but not yet consumed by the
        // inflater.
        read_in: Vec<u8>,
        // Inflated bytes not yet handed to the reader.
        read_out: Vec<u8>,
        // Deflated bytes not yet written to the wire.
        write_out: Vec<u8>,
    }
}

impl<S> ZlibStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            compress: Compress::new(Compression::default(), true),
            decompress: Decompress::new(true),
            read_in: Vec::new(),
            read_out: Vec::new(),
            write_out: Vec::new(),
        }
    }
}

fn deflate(compress: &mut Compress, mut input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
    loop {
        out.reserve(input.len().max(128) + 64);
        let before = compress.total_in();
        compress
            .compress_vec(input, out, FlushCompress::Sync)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let consumed = (compress.total_in() - before) as usize;
        input = &input[consumed..];
        // The sync flush is complete once output space is left over.
        if input.is_empty() && out.len() < out.capacity() {
            return Ok(());
        }
    }
}

fn inflate(decompress: &mut Decompress, input: &mut Vec<u8>, out: &mut Vec<u8>) -> io::Result<()> {
    loop {
        out.reserve(input.len().max(256) * 2);
        let before_in = decompress.total_in();
        let before_out = out.len();
        let status = decompress
            .decompress_vec(input, out, FlushDecompress::Sync)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let consumed = (decompress.total_in() - before_in) as usize;
        input.drain(..consumed);
        if status == Status::StreamEnd {
            return Ok(());
        }
        // An output buffer filled to capacity can hide bytes still pending
        // inside the inflater; only a call that left spare space has fully
        // drained it.
        if out.len() == out.capacity() {
            continue;
        }
        if input.is_empty() {
            return Ok(());
        }
        if consumed == 0 && out.len() == before_out {
            // Needs more input than we have; whatever is left stays buffered
            // for the next read.
            return Ok(());
        }
    }
}

impl<S: AsyncRead> AsyncRead for ZlibStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        loop {
            if !this.read_out.is_empty() {
                let n = buf.remaining().min(this.read_out.len());
                buf.put_slice(&this.read_out[..n]);
                this.read_out.drain(..n);
                return Poll::Ready(Ok(()));
            }

            let mut raw = [0u8; 4096];
            let mut raw_buf = ReadBuf::new(&mut raw);
            ready!(this.inner.as_mut().poll_read(cx, &mut raw_buf))?;
            let filled = raw_buf.filled();
            if filled.is_empty() {
                // EOF on the underlying transport.
                return Poll::Ready(Ok(()));
            }
            this.read_in.extend_from_slice(filled);
            inflate(this.decompress, this.read_in, this.read_out)?;
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for ZlibStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();

        // Finish draining deflated bytes from a previous write first.
        while !this.write_out.is_empty() {
            match ready!(this.inner.as_mut().poll_write(cx, this.write_out))? {
                0 => return Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
                n => {
                    this.write_out.drain(..n);
                }
            }
        }

        deflate(this.compress, buf, this.write_out)?;

        // Push to the wire opportunistically; leftovers go out on flush.
        while !this.write_out.is_empty() {
            match this.inner.as_mut().poll_write(cx, this.write_out) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()))
                }
                Poll::Ready(Ok(n)) => {
                    this.write_out.drain(..n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => break,
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        while !this.write_out.is_empty() {
            match ready!(this.inner.as_mut().poll_write(cx, this.write_out))? {
                0 => return Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
                n => {
                    this.write_out.drain(..n);
                }
            }
        }
        this.inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        while !this.write_out.is_empty() {
            match ready!(this.inner.as_mut().poll_write(cx, this.write_out))? {
                0 => return Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
                n => {
                    this.write_out.drain(..n);
                }
            }
        }
        ready!(this.inner.as_mut().poll_flush(cx))?;
        this.inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_round_trip_between_two_wrapped_ends() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut sender = ZlibStream::new(a);
        let mut receiver = ZlibStream::new(b);

        let payload = b"<message to='user@example.org'><body>hello</body></message>";
        sender.write_all(payload).await.unwrap();
        sender.flush().await.unwrap();

        let mut got = vec![0u8; payload.len()];
        receiver.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, payload);
    }

    #[tokio::test]
    async fn test_sync_flush_makes_each_write_decodable() {
        // Without sync flush the second read would stall waiting for more
        // compressed input.
        let (a, b) = tokio::io::duplex(64 * 1024);
        let mut sender = ZlibStream::new(a);
        let mut receiver = ZlibStream::new(b);

        for chunk in [&b"<presence/>"[..], &b"<iq type='get' id='1'/>"[..]] {
            sender.write_all(chunk).await.unwrap();
            sender.flush().await.unwrap();

            let mut got = vec![0u8; chunk.len()];
            receiver.read_exact(&mut got).await.unwrap();
            assert_eq!(&got, chunk);
        }
    }

    #[tokio::test]
    async fn test_dictionary_persists_across_writes() {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let mut sender = ZlibStream::new(a);
        let mut receiver = ZlibStream::new(b);

        // Repetitive stanzas compress dramatically once the dictionary warms
        // up; correctness across many flushes is what matters here.
        let stanza = b"<message from='a@example.org' to='b@example.org'><body>the same body text</body></message>";
        for _ in 0..50 {
            sender.write_all(stanza).await.unwrap();
            sender.flush().await.unwrap();
        }
        let mut got = vec![0u8; stanza.len() * 50];
        receiver.read_exact(&mut got).await.unwrap();
        for chunk in got.chunks(stanza.len()) {
            assert_eq!(chunk, stanza);
        }
    }

    #[tokio::test]
    async fn test_highly_compressible_burst_fully_drained() {
        // The whole burst deflates to a few hundred bytes, so the receiver
        // picks up one small compressed chunk that must inflate to far more
        // output than the chunk size suggests. Bytes pending inside the
        // inflater after the output buffer fills must still come out.
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let mut sender = ZlibStream::new(a);
        let mut receiver = ZlibStream::new(b);

        let payload = vec![b'a'; 100_000];
        sender.write_all(&payload).await.unwrap();
        sender.flush().await.unwrap();

        let mut got = vec![0u8; payload.len()];
        receiver.read_exact(&mut got).await.unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn test_inflate_drains_output_beyond_first_reservation() {
        let mut compress = Compress::new(Compression::default(), true);
        let payload = vec![b'x'; 50_000];
        let mut compressed = Vec::new();
        deflate(&mut compress, &payload, &mut compressed).unwrap();
        assert!(compressed.len() < 1024);

        let mut decompress = Decompress::new(true);
        let mut input = compressed;
        let mut out = Vec::new();
        inflate(&mut decompress, &mut input, &mut out).unwrap();
        assert!(input.is_empty());
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_large_payload() {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let mut sender = ZlibStream::new(a);
        let mut receiver = ZlibStream::new(b);

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            sender.write_all(&payload).await.unwrap();
            sender.flush().await.unwrap();
            sender
        });

        let mut got = vec![0u8; expected.len()];
        receiver.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
        writer.await.unwrap();
    }
}
