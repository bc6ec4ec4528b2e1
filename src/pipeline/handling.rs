use std::collections::HashMap;
use std::sync::Arc;

use tokio::{
    sync::mpsc::{self, Receiver, Sender},
    task::{AbortHandle, JoinHandle},
};
use uuid::Uuid;

use crate::{
    constants::RES_TX_ERR,
    core::reporter::Response,
    pipeline::models::{MsgToHandle, MsgToRes},
    service::{DiffService, RequestError, SubmitRequest},
};

/// Runs started by one connection.
#[derive(Debug)]
struct Connection {
    runs: Vec<AbortHandle>,
    /// Every run holds a clone; `drained` yields `None` once all are gone.
    in_flight: Sender<()>,
    drained: Receiver<()>,
}

impl Connection {
    fn new() -> Self {
        let (in_flight, drained) = mpsc::channel(1);
        Connection {
            runs: Vec::new(),
            in_flight,
            drained,
        }
    }
}

/// Starts one run per request line. Runs belonging to a connection are
/// aborted as soon as that connection is gone; after a half-close they are
/// allowed to finish and the connection is closed behind the last answer.
pub fn handle_messages(
    service: Arc<DiffService>,
    res_tx: Sender<MsgToRes>,
    mut msg_handle_rx: Receiver<MsgToHandle>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut connections: HashMap<Uuid, Connection> = HashMap::new();
        // Half-closed connections whose runs are still being answered.
        let mut draining: HashMap<Uuid, Vec<AbortHandle>> = HashMap::new();

        while let Some(msg) = msg_handle_rx.recv().await {
            match msg {
                MsgToHandle::Request { id, text } => {
                    if text.trim().is_empty() {
                        continue;
                    }
                    let request = match serde_json::from_str::<SubmitRequest>(&text) {
                        Ok(request) => request,
                        Err(e) => {
                            let response: Response = RequestError::Malformed(e.to_string()).into();
                            res_tx
                                .send(MsgToRes::line(id, response.to_json_line()))
                                .await
                                .expect(RES_TX_ERR);
                            continue;
                        }
                    };

                    let connection = connections.entry(id).or_insert_with(Connection::new);
                    let service = service.clone();
                    let res_tx = res_tx.clone();
                    let in_flight = connection.in_flight.clone();
                    let handle = tokio::spawn(async move {
                        let _in_flight = in_flight;
                        let response = service.submit(request).await;
                        res_tx
                            .send(MsgToRes::line(id, response.to_json_line()))
                            .await
                            .expect(RES_TX_ERR);
                    });

                    connection.runs.retain(|h| !h.is_finished());
                    connection.runs.push(handle.abort_handle());
                    tracing::info!(
                        "Connection {} started a run ({} in flight)",
                        id,
                        connection.runs.len()
                    );
                }
                MsgToHandle::Invalid { id, reason } => {
                    res_tx
                        .send(MsgToRes::line(id, Response::error(reason).to_json_line()))
                        .await
                        .expect(RES_TX_ERR);
                    close(&mut connections, &mut draining, id, &res_tx).await;
                }
                MsgToHandle::Eof { id } => {
                    draining.retain(|_, runs| runs.iter().any(|h| !h.is_finished()));
                    let Some(Connection {
                        runs,
                        in_flight,
                        mut drained,
                    }) = connections.remove(&id)
                    else {
                        res_tx.send(MsgToRes::Close { id }).await.expect(RES_TX_ERR);
                        continue;
                    };
                    drop(in_flight);
                    draining.insert(id, runs);

                    let res_tx = res_tx.clone();
                    tokio::spawn(async move {
                        // Answers are queued before their run lets go of its sender.
                        while drained.recv().await.is_some() {}
                        tracing::debug!("Connection {} answered every request", id);
                        res_tx.send(MsgToRes::Close { id }).await.expect(RES_TX_ERR);
                    });
                }
                MsgToHandle::Closed { id } => {
                    close(&mut connections, &mut draining, id, &res_tx).await
                }
            }
        }
    })
}

async fn close(
    connections: &mut HashMap<Uuid, Connection>,
    draining: &mut HashMap<Uuid, Vec<AbortHandle>>,
    id: Uuid,
    res_tx: &Sender<MsgToRes>,
) {
    let mut handles = connections.remove(&id).map(|c| c.runs).unwrap_or_default();
    handles.extend(draining.remove(&id).unwrap_or_default());
    let aborted = handles.iter().filter(|h| !h.is_finished()).count();
    for handle in handles {
        handle.abort();
    }
    if aborted > 0 {
        tracing::info!("Connection {} closed, aborted {} runs", id, aborted);
    }
    res_tx.send(MsgToRes::Close { id }).await.expect(RES_TX_ERR);
}
