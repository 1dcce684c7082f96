use crate::error::ServeError;
use crate::metrics::{counters, gauges};
use crate::policy;
use crate::server::ServerState;
use graylag_common::frame::{Request, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Services one accepted connection: read a request, answer it, close.
pub async fn handle_connection<S>(
    stream: S,
    peer: &str,
    state: Arc<ServerState>,
) -> Result<(), ServeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    gauges::inc_connections_active();
    let result = serve(stream, peer, &state).await;
    gauges::dec_connections_active();
    result
}

async fn serve<S>(stream: S, peer: &str, state: &ServerState) -> Result<(), ServeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let deadline = Duration::from_secs(state.config.read_timeout);

    let request = match timeout(deadline, read_request(&mut reader)).await {
        Ok(Ok(request)) => request,
        Ok(Err(error)) => {
            // Protocol failures still get the one promised response.
            warn!(peer, %error, "malformed request");
            counters::protocol_errors_total();
            write_response(&mut write_half, &Response::dunno()).await?;
            return Err(error);
        }
        Err(_) => {
            warn!(peer, "read deadline expired");
            counters::protocol_errors_total();
            write_response(&mut write_half, &Response::dunno()).await?;
            return Err(ServeError::ReadTimeout);
        }
    };

    let now = chrono::Utc::now().timestamp();
    let response = policy::evaluate(state, &request, now).await;
    debug!(peer, action = response.action(), "request answered");
    write_response(&mut write_half, &response).await
}

/// Collects `name=value` lines until the empty terminator line.
async fn read_request<R>(reader: &mut R) -> Result<Request, ServeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut request = Request::new();
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                ServeError::Encoding
            } else {
                ServeError::Io(e)
            }
        })?;
        if n == 0 {
            return Err(ServeError::ConnectionClosed);
        }
        let trimmed = line.trim_end_matches('\n');
        let trimmed = trimmed.strip_suffix('\r').unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Ok(request);
        }
        request.push_line(trimmed)?;
    }
}

async fn write_response<W>(writer: &mut W, response: &Response) -> Result<(), ServeError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(response.render().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
