use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::{AppContext, pipeline};

pub async fn start_listener(app: AppContext) -> Result<()> {
    let address = app.settings.listen_address();
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind listener on {address}"))?;
    serve(listener, app).await
}

/// Accept loop over an already-bound listener; each connection gets its own
/// task so requests progress independently.
pub async fn serve(listener: TcpListener, app: AppContext) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, api_url = %app.settings.api_url, "proxy listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(error = %err, "accept failed");
                continue;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %err, "could not enable TCP_NODELAY for the client");
        }
        let connection_app = app.clone();
        tokio::spawn(async move {
            if let Err(err) = pipeline::serve_connection(stream, peer, connection_app).await {
                debug!(peer = %peer, error = %err, "connection ended with error");
            }
        });
    }
}
