use tokio::{
    io::AsyncWriteExt,
    sync::mpsc::{Receiver, Sender},
    task::JoinHandle,
};

use crate::{
    constants::MSG_HANDLE_TX_ERR,
    pipeline::{
        models::{MsgToHandle, MsgToRes},
        reading::Sockets,
    },
};

/// Writes response lines. A failed write means the client is gone, which is
/// reported back to the handling stage so its other runs are aborted.
pub fn respond(
    sockets: Sockets,
    mut res_rx: Receiver<MsgToRes>,
    msg_handle_tx: Sender<MsgToHandle>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = res_rx.recv().await {
            let (id, text) = match msg {
                MsgToRes::Line { id, text } => (id, text),
                MsgToRes::Close { id } => {
                    // Dropping the write half shuts the connection down.
                    sockets.remove(&id);
                    continue;
                }
            };

            let Some(socket) = sockets.get(&id).map(|entry| entry.value().clone()) else {
                tracing::debug!("Socket {} is gone, dropping response", id);
                continue;
            };

            let mut stream = socket.lock().await;
            let result = match stream.write_all(text.as_bytes()).await {
                Ok(()) => stream.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::warn!("Failed to write to socket {}: {}", id, e);
                drop(stream);
                sockets.remove(&id);
                // Handling may itself be blocked sending to us.
                let msg_handle_tx = msg_handle_tx.clone();
                tokio::spawn(async move {
                    msg_handle_tx
                        .send(MsgToHandle::Closed { id })
                        .await
                        .expect(MSG_HANDLE_TX_ERR);
                });
            }
        }
    })
}
