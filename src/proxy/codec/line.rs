use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::timeout;

/// Reads one newline-terminated line into `buf`, bounded by `max_len` and a
/// per-read timeout. Returns the number of raw bytes consumed; `0` means the
/// peer closed the connection before sending anything.
pub(crate) async fn read_line_with_timeout<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line limit must be positive");
    buf.clear();
    let mut raw: Vec<u8> = Vec::new();
    let mut finished = false;

    while !finished {
        let chunk = timeout(timeout_dur, reader.fill_buf())
            .await
            .map_err(|_| anyhow!("timed out waiting for a line from {peer}"))?
            .map_err(|err| anyhow!("read from {peer} failed: {err}"))?;

        if chunk.is_empty() {
            if raw.is_empty() {
                return Ok(0);
            }
            bail!("{peer} closed the connection mid-line");
        }

        let take = match chunk.iter().position(|byte| *byte == b'\n') {
            Some(pos) => {
                finished = true;
                pos + 1
            }
            None => chunk.len(),
        };
        if raw.len().saturating_add(take) > max_len {
            bail!("line from {peer} is longer than the {max_len} byte limit");
        }
        raw.extend_from_slice(&chunk[..take]);
        reader.consume(take);
    }

    let text = String::from_utf8(raw).map_err(|_| anyhow!("line from {peer} is not valid UTF-8"))?;
    let read = text.len();
    *buf = text;
    Ok(read)
}

/// Strips the trailing CRLF (or bare LF) from a line.
pub(crate) fn trim_line(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}
