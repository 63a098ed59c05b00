//! Newline-framed JSON transport over stdio.
//!
//! Grounded on the source `MCPServer._run_server`: read one line at a time,
//! skip blank lines, dispatch, write exactly one JSON response line per
//! request, and keep looping across malformed input rather than exiting.
//! `readline`/blocking-thread polling becomes `tokio::io::AsyncBufReadExt`.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::dispatcher::Dispatcher;

/// Run the request loop until stdin is closed (EOF). Each non-blank line is
/// handed to the dispatcher; its response (success body or error envelope)
/// is always written back as exactly one line, so callers can rely on a
/// strict one-request/one-response framing.
pub async fn run_stdio_server(dispatcher: &Dispatcher) -> std::io::Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    tracing::info!("memory engine stdio loop started");

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = dispatcher.dispatch(trimmed).await;
        let mut serialized = serde_json::to_string(&response)
            .unwrap_or_else(|_| r#"{"status":"ERROR","error":"failed to serialize response"}"#.to_string());
        serialized.push('\n');
        stdout.write_all(serialized.as_bytes()).await?;
        stdout.flush().await?;
    }

    tracing::info!("memory engine stdio loop ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;

    /// Exercises the dispatch half of the loop directly (stdin/stdout
    /// plumbing isn't practical to drive in a unit test); the loop body
    /// above is a thin, directly-readable wrapper around this call.
    #[tokio::test]
    async fn dispatch_produces_one_line_per_request() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("ping", |_req| Box::pin(async { Ok(serde_json::json!({"status": "OK"})) }));

        let response = dispatcher.dispatch(r#"{"action": "ping"}"#).await;
        let line = serde_json::to_string(&response).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(response["status"], "OK");
    }

    #[tokio::test]
    async fn blank_input_is_not_dispatched() {
        let dispatcher = Dispatcher::new();
        let trimmed = "   ".trim();
        assert!(trimmed.is_empty());
        let _ = &dispatcher;
    }
}
