//! ACP stdio server.
//!
//! Runs the agent protocol over the process's stdin/stdout: requests come
//! in one JSON object per line, responses and `session_update`
//! notifications go out the same way. All output is funneled through one
//! writer task so updates keep the order they were produced in; logging
//! goes to stderr only, since stdout is reserved for the protocol.
//!
//! SIGTERM and stdin EOF both drain into the same shutdown path, which
//! closes every session's bridge before exiting.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::{mcp_bridge_factory, AcpClient, Agent, EnvFn};
use crate::protocol::{
    rpc_error, rpc_notification, rpc_response, CancelParams, InitializeParams, JsonRpcRequest,
    PromptParams, SessionNotification,
};

/// Client handle that writes `session_update` notifications to stdout.
struct StdioClient {
    sender: mpsc::UnboundedSender<Value>,
}

#[async_trait]
impl AcpClient for StdioClient {
    async fn session_update(&self, notification: SessionNotification) {
        let Ok(params) = serde_json::to_value(&notification) else {
            return;
        };
        let _ = self.sender.send(rpc_notification("session_update", params));
    }
}

async fn dispatch(
    agent: Arc<Agent>,
    sender: mpsc::UnboundedSender<Value>,
    request: JsonRpcRequest,
) {
    match request.method.as_str() {
        "initialize" => {
            let params: InitializeParams =
                serde_json::from_value(request.params).unwrap_or_else(|_| InitializeParams {
                    protocol_version: Value::Null,
                    client_capabilities: None,
                    client_info: None,
                });
            let result = agent.initialize(params).await;
            if let Some(id) = request.id {
                let _ = sender.send(rpc_response(
                    id,
                    serde_json::to_value(result).unwrap_or(Value::Null),
                ));
            }
        }
        "new_session" | "session/new" => {
            let Some(id) = request.id else { return };
            match agent.new_session().await {
                Ok(result) => {
                    let _ = sender.send(rpc_response(
                        id,
                        serde_json::to_value(result).unwrap_or(Value::Null),
                    ));
                }
                Err(err) => {
                    warn!(error = %err, "new_session failed");
                    let _ = sender.send(rpc_error(id, -32603, &err.to_string()));
                }
            }
        }
        "prompt" | "session/prompt" => {
            let Some(id) = request.id else { return };
            let params: PromptParams = match serde_json::from_value(request.params) {
                Ok(params) => params,
                Err(err) => {
                    let _ = sender.send(rpc_error(id, -32602, &format!("invalid params: {err}")));
                    return;
                }
            };
            // Prompts run concurrently across sessions; the per-session
            // mutex inside the agent serializes same-session prompts.
            tokio::spawn(async move {
                let result = agent.prompt(params).await;
                let _ = sender.send(rpc_response(
                    id,
                    serde_json::to_value(result).unwrap_or(Value::Null),
                ));
            });
        }
        "cancel" | "session/cancel" => {
            let params: Option<CancelParams> = serde_json::from_value(request.params).ok();
            if let Some(params) = params {
                agent.cancel(&params.session_id).await;
            }
            if let Some(id) = request.id {
                let _ = sender.send(rpc_response(id, Value::Null));
            }
        }
        "initialized" => {}
        other => {
            debug!(method = other, "unknown method");
            if let Some(id) = request.id {
                let _ = sender.send(rpc_error(id, -32601, &format!("method not found: {other}")));
            }
        }
    }
}

/// Run the agent over stdio until stdin closes or the process is asked to
/// terminate.
pub async fn run_acp_server() -> Result<()> {
    let (sender, mut receiver) = mpsc::unbounded_channel::<Value>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = receiver.recv().await {
            let mut line = message.to_string();
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let env: EnvFn = Arc::new(|key: &str| std::env::var(key).ok());
    let client = Arc::new(StdioClient {
        sender: sender.clone(),
    });
    let agent = Arc::new(Agent::new(
        client,
        mcp_bridge_factory(env.clone()),
        env,
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    info!("ACP agent listening on stdio");
    loop {
        #[cfg(unix)]
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
        };
        #[cfg(not(unix))]
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => break,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "stdin read failed");
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
            Ok(request) => request,
            Err(err) => {
                debug!(error = %err, "discarding unparseable request line");
                continue;
            }
        };

        dispatch(agent.clone(), sender.clone(), request).await;
    }

    agent.cleanup_all_sessions().await;
    drop(sender);
    let _ = writer.await;
    Ok(())
}
