//! WebSocket streaming endpoint
//!
//! JSON frames `{type, request_id, data}`. A `completion` frame starts a
//! streaming completion; the socket answers with `completion_started`, a
//! `completion_chunk` per delta, and `completion_finished`. Errors come back
//! as `error` frames and leave the socket open unless the transport itself
//! failed.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::handlers::GatewayState;
use crate::api::types::CompletionBody;
use crate::llm::ResponseChunk;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Completion {
        request_id: String,
        data: CompletionBody,
    },
    Ping {
        #[serde(default)]
        request_id: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    CompletionStarted {
        request_id: String,
    },
    CompletionChunk {
        request_id: String,
        data: ResponseChunk,
    },
    CompletionFinished {
        request_id: String,
    },
    Error {
        request_id: String,
        data: ErrorData,
    },
}

#[derive(Debug, Serialize)]
struct ErrorData {
    error: String,
    code: String,
}

/// GET /api/v1/ws
pub async fn websocket(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let (mut sink, mut source) = socket.split();
    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<ServerFrame>(64);
    let cancel = CancellationToken::new();

    // Single writer task; completion tasks post frames through the channel.
    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(json) = serde_json::to_string(&frame) else {
                continue;
            };
            if sink.send(Message::Text(json)).await.is_err() {
                writer_cancel.cancel();
                return;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = source.next().await {
        let message = match message {
            Ok(message) => message,
            Err(error) => {
                debug!("websocket read error: {error}");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                let frame = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => frame,
                    Err(error) => {
                        let _ = out_tx
                            .send(ServerFrame::Error {
                                request_id: String::new(),
                                data: ErrorData {
                                    error: format!("malformed frame: {error}"),
                                    code: "bad_request".into(),
                                },
                            })
                            .await;
                        continue;
                    }
                };

                match frame {
                    ClientFrame::Ping { request_id } => {
                        let _ = out_tx.send(ServerFrame::Pong { request_id }).await;
                    }
                    ClientFrame::Completion { request_id, data } => {
                        let pipeline = state.pipeline.clone();
                        let out = out_tx.clone();
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            run_completion(pipeline, out, request_id, data, cancel).await;
                        });
                    }
                }
            }
            Message::Ping(payload) => {
                // Transport-level ping; axum answers with the frame protocol
                // too for symmetric clients.
                debug!("transport ping ({} bytes)", payload.len());
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    cancel.cancel();
    drop(out_tx);
    let _ = writer.await;
}

async fn run_completion(
    pipeline: std::sync::Arc<crate::llm::pipeline::Pipeline>,
    out: tokio::sync::mpsc::Sender<ServerFrame>,
    request_id: String,
    body: CompletionBody,
    cancel: CancellationToken,
) {
    let request = match body.into_request() {
        Ok(request) => request,
        Err(problem) => {
            let _ = out
                .send(ServerFrame::Error {
                    request_id,
                    data: ErrorData {
                        error: problem.detail,
                        code: problem.code,
                    },
                })
                .await;
            return;
        }
    };

    let mut stream = match pipeline.execute_stream(request, cancel.clone()).await {
        Ok(stream) => stream,
        Err(error) => {
            let _ = out
                .send(ServerFrame::Error {
                    request_id,
                    data: ErrorData {
                        error: error.to_string(),
                        code: error.public_code().to_string(),
                    },
                })
                .await;
            return;
        }
    };

    if out
        .send(ServerFrame::CompletionStarted {
            request_id: request_id.clone(),
        })
        .await
        .is_err()
    {
        cancel.cancel();
        return;
    }

    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => {
                if out
                    .send(ServerFrame::CompletionChunk {
                        request_id: request_id.clone(),
                        data: chunk,
                    })
                    .await
                    .is_err()
                {
                    cancel.cancel();
                    return;
                }
            }
            Err(error) => {
                warn!("websocket stream error: {error}");
                let _ = out
                    .send(ServerFrame::Error {
                        request_id: request_id.clone(),
                        data: ErrorData {
                            error: error.to_string(),
                            code: error.public_code().to_string(),
                        },
                    })
                    .await;
                break;
            }
        }
    }

    let _ = out.send(ServerFrame::CompletionFinished { request_id }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse() {
        let frame: ClientFrame = serde_json::from_str(
            r#"{"type":"completion","request_id":"r1","data":{"model":"m","messages":[{"role":"user","content":"hi"}]}}"#,
        )
        .unwrap();
        assert!(matches!(frame, ClientFrame::Completion { .. }));

        let ping: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientFrame::Ping { .. }));
    }

    #[test]
    fn server_frames_serialize_with_type_tag() {
        let frame = ServerFrame::CompletionFinished {
            request_id: "r1".into(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "completion_finished");
        assert_eq!(json["request_id"], "r1");
    }
}
