use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::time::timeout;

use super::line::{read_line_with_timeout, trim_line};

const MAX_CHUNK_SIZE_LINE: usize = 128;

/// How the body of a message is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyPlan {
    Empty,
    Fixed(usize),
    Chunked,
    UntilClose,
}

/// Materializes a message body according to its framing. The whole body is
/// read under one timeout and bounded by `max_len`; streaming semantics are
/// deliberately not supported.
pub(crate) async fn read_body<S>(
    reader: &mut BufReader<S>,
    plan: BodyPlan,
    max_len: usize,
    timeout_dur: Duration,
    peer: SocketAddr,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    match plan {
        BodyPlan::Empty => Ok(Bytes::new()),
        BodyPlan::Fixed(len) => {
            ensure!(
                len <= max_len,
                "body of {len} bytes from {peer} exceeds configured limit of {max_len} bytes"
            );
            let mut body = vec![0u8; len];
            timeout(timeout_dur, reader.read_exact(&mut body))
                .await
                .map_err(|_| anyhow!("timed out reading body from {peer}"))?
                .with_context(|| format!("failed reading body from {peer}"))?;
            Ok(Bytes::from(body))
        }
        BodyPlan::Chunked => read_chunked_body(reader, max_len, timeout_dur, peer).await,
        BodyPlan::UntilClose => read_until_close(reader, max_len, timeout_dur, peer).await,
    }
}

async fn read_chunked_body<S>(
    reader: &mut BufReader<S>,
    max_len: usize,
    timeout_dur: Duration,
    peer: SocketAddr,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let mut line = String::new();

    loop {
        let read =
            read_line_with_timeout(reader, &mut line, timeout_dur, peer, MAX_CHUNK_SIZE_LINE)
                .await?;
        if read == 0 {
            bail!("connection closed before chunk size from {peer}");
        }
        // Chunk extensions after ';' are ignored.
        let size_text = trim_line(&line)
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| anyhow!("invalid chunk size {size_text:?} from {peer}"))?;

        if size == 0 {
            // Trailer section runs until an empty line; trailers are dropped.
            loop {
                let read =
                    read_line_with_timeout(reader, &mut line, timeout_dur, peer, MAX_CHUNK_SIZE_LINE)
                        .await?;
                if read == 0 {
                    bail!("connection closed during chunked trailers from {peer}");
                }
                if trim_line(&line).is_empty() {
                    break;
                }
            }
            break;
        }

        ensure!(
            body.len().saturating_add(size) <= max_len,
            "chunked body from {peer} exceeds configured limit of {max_len} bytes"
        );

        let start = body.len();
        body.resize(start + size, 0);
        timeout(timeout_dur, reader.read_exact(&mut body[start..]))
            .await
            .map_err(|_| anyhow!("timed out reading chunk from {peer}"))?
            .with_context(|| format!("failed reading chunk from {peer}"))?;

        let mut crlf = [0u8; 2];
        timeout(timeout_dur, reader.read_exact(&mut crlf))
            .await
            .map_err(|_| anyhow!("timed out reading chunk terminator from {peer}"))?
            .with_context(|| format!("failed reading chunk terminator from {peer}"))?;
        ensure!(&crlf == b"\r\n", "malformed chunk terminator from {peer}");
    }

    Ok(Bytes::from(body))
}

async fn read_until_close<S>(
    reader: &mut BufReader<S>,
    max_len: usize,
    timeout_dur: Duration,
    peer: SocketAddr,
) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let mut body = Vec::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let read = timeout(timeout_dur, reader.read(&mut buf))
            .await
            .map_err(|_| anyhow!("timed out reading body from {peer}"))?
            .with_context(|| format!("failed reading body from {peer}"))?;
        if read == 0 {
            break;
        }
        ensure!(
            body.len().saturating_add(read) <= max_len,
            "body from {peer} exceeds configured limit of {max_len} bytes"
        );
        body.extend_from_slice(&buf[..read]);
    }
    Ok(Bytes::from(body))
}
