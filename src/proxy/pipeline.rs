use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Result;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, warn};

use crate::cache::{CacheEntry, cache_key, hydrate, invalidate};
use crate::config::Method;
use crate::logging::{AccessLogBuilder, CacheDisposition};
use crate::metrics;

use super::AppContext;
use super::codec::{self, RequestHead};
use super::headers::forwardable_request_headers;

pub(super) enum ClientDisposition {
    Continue,
    Close,
}

/// Serves one downstream connection: reads requests in a keep-alive loop and
/// runs each through the dispatch pipeline.
pub(super) async fn serve_connection<S>(stream: S, peer: SocketAddr, app: AppContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    loop {
        let head = match codec::read_request_head(
            &mut reader,
            peer,
            app.settings.client_timeout(),
            app.settings.client_timeout(),
            app.settings.max_header_size,
        )
        .await
        {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(err) => {
                warn!(peer = %peer, error = %err, "invalid request");
                codec::write_error(reader.get_mut(), StatusCode::BAD_REQUEST, "invalid request\r\n")
                    .await
                    .ok();
                break;
            }
        };

        match handle_request(&mut reader, peer, &app, head).await? {
            ClientDisposition::Continue => continue,
            ClientDisposition::Close => break,
        }
    }
    Ok(())
}

/// Dispatches one request: bust stage, cache lookup, upstream proxy, and
/// response capture, in that order.
async fn handle_request<S>(
    reader: &mut BufReader<S>,
    peer: SocketAddr,
    app: &AppContext,
    head: RequestHead,
) -> Result<ClientDisposition>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start = Instant::now();
    let close = head.connection_close;
    let head_only = head.method == http::Method::HEAD;

    let body = match codec::read_body(
        reader,
        head.body_plan(),
        app.settings.max_body_size,
        app.settings.client_timeout(),
        peer,
    )
    .await
    {
        Ok(body) => body,
        Err(err) => {
            warn!(peer = %peer, error = %err, "failed to read request body");
            codec::write_error(
                reader.get_mut(),
                StatusCode::BAD_REQUEST,
                "invalid request body\r\n",
            )
            .await
            .ok();
            return Ok(ClientDisposition::Close);
        }
    };

    let (path, query) = head.path_and_query();
    let path = path.to_string();
    let query = query.map(str::to_string);

    let matched = Method::from_http(&head.method)
        .and_then(|method| app.routes.find(method, &path));

    // Bust runs before the upstream request: better an extra miss than a
    // concurrent cacheable request observing entries this call supersedes.
    let mut busted = 0u64;
    if let Some(matched) = &matched
        && !matched.route.bust_patterns().is_empty()
    {
        let patterns = hydrate(matched.route.bust_patterns(), &matched.params);
        match invalidate(&app.cache, &patterns) {
            Ok(count) => {
                busted = count as u64;
                metrics::record_busted(busted);
                debug!(
                    peer = %peer,
                    route = matched.route.template(),
                    busted,
                    "bust stage evicted entries"
                );
            }
            Err(err) => {
                warn!(
                    peer = %peer,
                    route = matched.route.template(),
                    error = %err,
                    "cache invalidation failed; proxying anyway"
                );
            }
        }
    }

    let cache_slot = matched
        .as_ref()
        .filter(|matched| matched.route.is_cacheable())
        .map(|_| cache_key(&head.method, &path, query.as_deref()));

    // Read-cache stage: a hit short-circuits the proxy entirely.
    if let Some(key) = &cache_slot
        && let Some(entry) = app.cache.get(key)
    {
        let bytes_out = codec::write_response(
            reader.get_mut(),
            entry.status(),
            entry.headers(),
            entry.body(),
            Some("HIT"),
            head_only,
            close,
        )
        .await?;
        AccessLogBuilder::new(peer)
            .method(head.method.as_str())
            .path(&head.target)
            .status(entry.status())
            .cache(CacheDisposition::Hit)
            .busted(busted)
            .bytes_out(bytes_out)
            .elapsed(start.elapsed())
            .log();
        return Ok(if close {
            ClientDisposition::Close
        } else {
            ClientDisposition::Continue
        });
    }

    // Proxy stage.
    let forward_headers = forwardable_request_headers(&head.headers);
    let disposition = if cache_slot.is_some() {
        CacheDisposition::Miss
    } else {
        CacheDisposition::Bypass
    };
    let response = match app
        .upstream
        .fetch(&head.method, &path, query.as_deref(), &forward_headers, &body)
        .await
    {
        Ok(response) => response,
        Err(err) => {
            warn!(peer = %peer, error = %err, "upstream exchange failed");
            metrics::record_upstream_error();
            codec::write_error(
                reader.get_mut(),
                StatusCode::BAD_GATEWAY,
                "upstream request failed\r\n",
            )
            .await?;
            AccessLogBuilder::new(peer)
                .method(head.method.as_str())
                .path(&head.target)
                .status(StatusCode::BAD_GATEWAY)
                .cache(disposition)
                .busted(busted)
                .elapsed(start.elapsed())
                .log();
            return Ok(ClientDisposition::Close);
        }
    };

    // Write-cache stage: only fresh 2xx responses are memoized; store
    // failures are logged and the response is served regardless.
    if let Some(key) = &cache_slot {
        if response.status.is_success() {
            let entry =
                CacheEntry::from_upstream(response.status, &response.headers, response.body.clone());
            match app.cache.set(key, entry) {
                Ok(evicted) => metrics::record_evictions(evicted as u64),
                Err(err) => {
                    warn!(peer = %peer, key = %key, error = %err, "response not cached");
                    metrics::record_store_error();
                }
            }
            metrics::set_cache_used(app.cache.used());
        } else {
            debug!(
                peer = %peer,
                key = %key,
                status = response.status.as_u16(),
                "non-success response not cached"
            );
        }
    }

    let x_cache = cache_slot.is_some().then_some("MISS");
    let bytes_out = codec::write_response(
        reader.get_mut(),
        response.status,
        &response.headers,
        &response.body,
        x_cache,
        head_only,
        close,
    )
    .await?;
    AccessLogBuilder::new(peer)
        .method(head.method.as_str())
        .path(&head.target)
        .status(response.status)
        .cache(disposition)
        .busted(busted)
        .bytes_out(bytes_out)
        .elapsed(start.elapsed())
        .log();

    Ok(if close {
        ClientDisposition::Close
    } else {
        ClientDisposition::Continue
    })
}
