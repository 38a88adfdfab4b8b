use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tungstenite::protocol::Message as WsMessage;

use crate::client::{Client, SocketKind};
use crate::hub::Hub;
use crate::message::Message;
use crate::transport::message::{self, ChannelParams, Frame, Method};
use crate::utils::{ErrorKind, PopError, Result};

/// Bind `addr` and serve sockets of `kind` until the hub shuts down.
pub async fn start_websocket_server(addr: &str, hub: Arc<Hub>, kind: SocketKind) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| PopError::internal(format!("cannot bind {addr}")).with_source(e))?;
    tracing::info!(addr, ?kind, "websocket server listening");
    serve(listener, hub, kind).await;
    Ok(())
}

/// Accept loop over an already bound listener.
pub async fn serve(listener: TcpListener, hub: Arc<Hub>, kind: SocketKind) {
    let mut shutdown = hub.shutdown_signal();
    loop {
        let (stream, remote) = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept connection");
                    continue;
                }
            },
        };

        let hub = hub.clone();
        tokio::spawn(async move {
            match accept_async(stream).await {
                Ok(ws) => run_socket(hub, ws, kind, false).await,
                Err(e) => tracing::warn!(%remote, error = %e, "websocket handshake error"),
            }
        });
    }
    tracing::info!(?kind, "websocket server stopped");
}

/// Dial a peer server; the connection is greeted and then served like an
/// accepted one.
pub async fn connect_peer(hub: Arc<Hub>, url: &str) -> Result<()> {
    let (ws, _) = connect_async(url)
        .await
        .map_err(|e| PopError::internal(format!("cannot connect to peer {url}")).with_source(e))?;
    tracing::info!(peer = url, "connected to peer");
    tokio::spawn(run_socket(hub, ws, SocketKind::Server, true));
    Ok(())
}

async fn run_socket<S>(hub: Arc<Hub>, ws: WebSocketStream<S>, kind: SocketKind, dialed: bool)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let client = match kind {
        SocketKind::Client => Client::new(tx),
        SocketKind::Server => Client::server(tx),
    };
    let client_id = client.id.clone();

    // registered before the first frame is read
    hub.on_socket_open(client.clone());
    if dialed {
        if let Err(e) = hub.greet(&client) {
            tracing::warn!(peer = %client_id, error = %e, "failed to greet peer");
        }
    }

    let writer_id = client_id.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                tracing::debug!(socket = %writer_id, error = %e, "write failed");
                break;
            }
        }
        tracing::debug!(socket = %writer_id, "send loop closed");
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => hub.submit(client.clone(), text.to_string()).await,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(socket = %client_id, error = %e, "read failed");
                break;
            }
        }
    }

    hub.on_socket_closed(&client_id);
}

/// Fetch the history of `channel` from the server at `url`.
pub async fn fetch_catchup(url: &str, channel: &str) -> Result<Vec<Message>> {
    let (mut ws, _) = connect_async(url)
        .await
        .map_err(|e| PopError::internal(format!("cannot connect to {url}")).with_source(e))?;

    let request = message::query(
        Some(1),
        &Method::Catchup(ChannelParams {
            channel: channel.to_string(),
        }),
    )?;
    ws.send(WsMessage::text(request))
        .await
        .map_err(|e| PopError::internal("failed to send catchup").with_source(e))?;

    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| PopError::internal("connection lost").with_source(e))?;
        let WsMessage::Text(text) = msg else {
            continue;
        };
        if let Frame::Answer { id: 1, result } = Frame::parse(text.as_str())? {
            let _ = ws.close(None).await;
            return match result {
                Ok(value) => Ok(serde_json::from_value(value)?),
                Err(body) => Err(PopError::new(ErrorKind::from_code(body.code), body.description)),
            };
        }
    }
    Err(PopError::internal(format!(
        "connection closed before the catchup of {channel} was answered"
    )))
}
