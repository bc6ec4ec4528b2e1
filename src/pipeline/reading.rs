use std::sync::Arc;

use dashmap::DashMap;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    net::{TcpStream, tcp::OwnedWriteHalf},
    sync::{
        Mutex,
        mpsc::{Receiver, Sender},
    },
    task::JoinHandle,
};
use uuid::Uuid;

use crate::{constants::MSG_HANDLE_TX_ERR, pipeline::models::MsgToHandle, service::RequestError};

pub type Sockets = Arc<DashMap<Uuid, Arc<Mutex<OwnedWriteHalf>>>>;

/// Splits every accepted connection, registers its write half and forwards
/// each request line to the handling stage.
pub fn read_sockets(
    sockets: Sockets,
    mut read_rx: Receiver<TcpStream>,
    msg_handle_tx: Sender<MsgToHandle>,
    max_request_bytes: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(socket) = read_rx.recv().await {
            let id = Uuid::new_v4();

            let (read_half, write_half) = socket.into_split();
            sockets.insert(id, Arc::new(Mutex::new(write_half)));

            let msg_handle_tx = msg_handle_tx.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(read_half);
                loop {
                    let mut buf = Vec::new();
                    let read = (&mut reader)
                        .take(max_request_bytes + 1)
                        .read_until(b'\n', &mut buf)
                        .await;

                    let msg = match read {
                        Ok(0) => MsgToHandle::Eof { id },
                        Ok(n) if n as u64 > max_request_bytes => MsgToHandle::Invalid {
                            id,
                            reason: RequestError::TooLarge(max_request_bytes).to_string(),
                        },
                        Ok(_) => MsgToHandle::Request {
                            id,
                            text: String::from_utf8_lossy(&buf).to_string(),
                        },
                        Err(e) => {
                            tracing::debug!("Connection {} read failed: {}", id, e);
                            MsgToHandle::Closed { id }
                        }
                    };

                    let last = !matches!(msg, MsgToHandle::Request { .. });
                    msg_handle_tx.send(msg).await.expect(MSG_HANDLE_TX_ERR);
                    if last {
                        break;
                    }
                }
            });
        }
    })
}
