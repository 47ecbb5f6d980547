use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::adapter::{Handler, SessionEvent};
use crate::client::Session;
use crate::messaging::Message;
use crate::transport::message::{ClientMessage, ServerMessage, decode_payload};

pub async fn start_websocket_server(addr: &str, handler: Arc<Handler>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("WebSocket server listening on ws://{}", listener.local_addr()?);
    serve(listener, handler).await;
    Ok(())
}

/// Accepts connections until the listener fails.
pub async fn serve(listener: TcpListener, handler: Arc<Handler>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("Accepted connection from {peer}");
                spawn(handle_connection(stream, handler.clone()));
            }
            Err(e) => {
                error!("Failed to accept connection: {e}");
                return;
            }
        }
    }
}

fn send(tx: &mpsc::UnboundedSender<WsMessage>, frame: &ServerMessage) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            let _ = tx.send(WsMessage::Text(text.into()));
        }
        Err(e) => warn!("Failed to serialize frame: {e}"),
    }
}

async fn handle_connection(stream: TcpStream, handler: Arc<Handler>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake error: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Frames for this client
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    // Messages delivered to the session's subscriptions
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let session = Arc::new(Session::new(None, out_tx));
    let client_id = session.id.clone();

    let writer_id = client_id.clone();
    spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                debug!("Failed to send frame to {writer_id}: {e}");
                break;
            }
        }
        debug!("Send loop closed for {writer_id}");
    });

    let deliveries = tx.clone();
    spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            send(&deliveries, &ServerMessage::delivery(&msg));
        }
    });

    // Frames are handled in order by one worker, so the read loop stays
    // free to notice the client going away.
    let (frames, mut queued) = mpsc::unbounded_channel::<ClientMessage>();
    let worker = {
        let (session, handler, tx) = (session.clone(), handler.clone(), tx.clone());
        spawn(async move {
            while let Some(frame) = queued.recv().await {
                let refuse = matches!(frame, ClientMessage::Connect { .. });
                match process(&handler, &session, frame).await {
                    Ok(reply) => send(&tx, &reply),
                    Err(reply) => {
                        send(&tx, &reply);
                        if refuse {
                            session.cancel();
                        }
                    }
                }
            }
        })
    };

    loop {
        let next = tokio::select! {
            _ = session.cancelled() => break,
            next = ws_receiver.next() => next,
        };
        let msg = match next {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!("Read error from {client_id}: {e}");
                break;
            }
            None => break,
        };
        if msg.is_close() {
            break;
        }
        if !msg.is_text() {
            continue;
        }
        let Ok(text) = msg.to_text() else {
            continue;
        };
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(frame) => {
                let _ = frames.send(frame);
            }
            Err(err) => {
                warn!("Invalid client message: {err} | {text}");
                send(&tx, &ServerMessage::error(format!("invalid frame: {err}")));
            }
        }
    }

    session.cancel();
    drop(frames);
    if let Err(e) = worker.await {
        warn!("Frame worker for {client_id} failed: {e}");
    }
    if let Err(e) = handler.handle(&session, SessionEvent::Disconnect).await {
        warn!("Disconnect of {client_id} failed: {e}");
    }
    let _ = tx.send(WsMessage::Close(None));
    info!("{client_id} disconnected");
}

/// Runs one client frame through the handler and builds the reply.
async fn process(
    handler: &Handler,
    session: &Session,
    frame: ClientMessage,
) -> Result<ServerMessage, ServerMessage> {
    let (event, reply) = match frame {
        ClientMessage::Connect { username, password } => (
            SessionEvent::Connect { username, password },
            ServerMessage::ConnAck {
                client_id: session.id.clone(),
            },
        ),
        ClientMessage::Publish {
            topic,
            payload,
            encoding,
        } => {
            let payload =
                decode_payload(payload, encoding.as_deref()).map_err(ServerMessage::error)?;
            (
                SessionEvent::Publish {
                    topic: topic.clone(),
                    payload,
                },
                ServerMessage::PubAck { topic },
            )
        }
        ClientMessage::Subscribe { topic } => (
            SessionEvent::Subscribe {
                topic: topic.clone(),
            },
            ServerMessage::SubAck { topic },
        ),
        ClientMessage::Unsubscribe { topic } => (
            SessionEvent::Unsubscribe {
                topic: topic.clone(),
            },
            ServerMessage::UnsubAck { topic },
        ),
    };
    match handler.handle(session, event).await {
        Ok(()) => Ok(reply),
        Err(err) => {
            debug!("{} request failed: {err}", session.id);
            Err(ServerMessage::error(err))
        }
    }
}
