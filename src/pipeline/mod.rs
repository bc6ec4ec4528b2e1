use std::sync::Arc;

use dashmap::DashMap;
use tokio::{io, net::TcpListener, sync::mpsc};

use crate::{constants::CHANNEL_CAPACITY, service::DiffService};

pub mod accepting;
pub mod handling;
pub mod models;
pub mod reading;
pub mod responding;

/// Wires accept → read → handle → respond and serves until accepting fails.
#[tracing::instrument(skip_all)]
pub async fn serve(
    listener: TcpListener,
    service: Arc<DiffService>,
    max_request_bytes: u64,
) -> io::Result<()> {
    let sockets: reading::Sockets = Arc::new(DashMap::new());
    let (read_tx, read_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (msg_handle_tx, msg_handle_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (res_tx, res_rx) = mpsc::channel(CHANNEL_CAPACITY);

    responding::respond(sockets.clone(), res_rx, msg_handle_tx.clone());
    handling::handle_messages(service, res_tx, msg_handle_rx);
    reading::read_sockets(sockets, read_rx, msg_handle_tx, max_request_bytes);

    accepting::accept_connections(listener, read_tx)
        .await
        .map_err(io::Error::other)?
}
