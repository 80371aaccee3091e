//! Transfer socket server: binary frames in, nothing out but a close frame
//! on protocol violations.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::{CloseFrame, Message as WsMessage};
use uuid::Uuid;

use crate::transfer::session::{TransferContext, TransferSession};

pub async fn start_transfer_server(listener: TcpListener, ctx: TransferContext) {
    match listener.local_addr() {
        Ok(addr) => info!("Transfer server listening on ws://{addr}"),
        Err(e) => warn!(error = %e, "Transfer server listening on unknown address"),
    }

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Accept failed");
                continue;
            }
        };
        let ctx = ctx.clone();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(%peer, error = %e, "WebSocket handshake error");
                    return;
                }
            };

            let conn = Uuid::new_v4();
            debug!(conn = %conn, %peer, "Transfer connection opened");
            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let mut session = TransferSession::new(conn, ctx);

            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(WsMessage::Binary(raw)) => {
                        let Err(e) = session.handle_frame(&raw).await else {
                            continue;
                        };
                        if e.is_violation() {
                            warn!(conn = %conn, error = %e, "Protocol violation, closing transfer connection");
                            let close = CloseFrame {
                                code: CloseCode::Protocol,
                                reason: e.to_string().into(),
                            };
                            let _ = ws_sender.send(WsMessage::Close(Some(close))).await;
                        } else {
                            error!(conn = %conn, error = %e, "Transfer session stopped");
                        }
                        break;
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(WsMessage::Text(_)) => {
                        debug!(conn = %conn, "Text frame on transfer socket ignored");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(conn = %conn, error = %e, "Transfer connection read error");
                        break;
                    }
                }
            }

            session.close().await;
            debug!(conn = %conn, "Transfer connection closed");
        });
    }
}
