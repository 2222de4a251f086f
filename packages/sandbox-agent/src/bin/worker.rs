//! Worker process (C1): the framed RPC loop that runs inside nsjail, pinned
//! to exactly one PreparedEnvironment for its whole life. Reads
//! length-prefixed frames from stdin, decodes, evaluates, writes
//! length-prefixed replies to stdout; stdout is reserved for the frame
//! stream, so all logging goes to stderr (spec.md §4.1, §6).

use sandbox_agent::error::Result;
use sandbox_agent::procedure::{self, Outcome, Procedure};
use sandbox_agent::protocol::{self, RpcReply, RpcRequest};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    loop {
        let frame = match protocol::read_frame(&mut stdin).await {
            Ok(Some(frame)) => frame,
            // Empty read on stdin is a graceful shutdown signal (§4.1).
            Ok(None) => {
                info!("stdin closed, shutting down");
                std::process::exit(0);
            }
            Err(e) => {
                error!(error = %e, "failed to read request frame, exiting");
                std::process::exit(1);
            }
        };

        let reply = match handle_one(&frame).await {
            Ok(reply) => reply,
            // Framing is still possible here - the failure was in decoding
            // or evaluating the request, not in the stdio transport itself -
            // so the worker replies WorkerInternal and keeps running (§4.1).
            Err(e) => RpcReply::failure("WorkerInternal", e.to_string(), None),
        };

        let payload = match protocol::encode_stdio(&reply) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to encode reply, exiting");
                std::process::exit(1);
            }
        };

        if let Err(e) = protocol::write_frame(&mut stdout, &payload).await {
            error!(error = %e, "failed to write reply frame, exiting");
            std::process::exit(1);
        }
    }
}

async fn handle_one(frame: &[u8]) -> Result<RpcReply> {
    let request: RpcRequest = protocol::decode_stdio(frame)?;
    let procedure: Procedure = protocol::decode_stdio(&request.procedure)?;
    // Drives an `Awaitable` to completion before replying (§4.1: "if the
    // evaluated value is a coroutine/future-like object, the worker drives
    // it to completion before serializing the result").
    match procedure::evaluate(procedure).await {
        Outcome::Value(bytes) => Ok(RpcReply::ok(bytes)),
        // The wire `kind` is the fixed taxonomy literal "UserError" (§7, §8
        // scenario 3), not the procedure's own exception class - that class
        // name (`kind` here) is preserved in `trace`, and `message` stays the
        // raw message so callers' substring checks (e.g. "contains \"bad\"")
        // see the original text rather than a class-name-prefixed rewrite.
        Outcome::Raised { message, trace, .. } => Ok(RpcReply::failure("UserError", message, Some(trace))),
    }
}
