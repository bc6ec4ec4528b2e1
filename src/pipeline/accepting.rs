use std::time::Duration;

use tokio::{
    io,
    net::{TcpListener, TcpStream},
    sync::mpsc::Sender,
    task::JoinHandle,
};

use crate::constants::READ_TX_ERR;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

pub fn accept_connections(
    listener: TcpListener,
    read_tx: Sender<TcpStream>,
) -> JoinHandle<io::Result<()>> {
    tokio::spawn(async move {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_transient(&e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            tracing::debug!("Accepted connection from {}", peer);
            read_tx.send(socket).await.expect(READ_TX_ERR);
        }
    })
}

/// Errors that concern a single connection attempt or a momentary shortage
/// of descriptors, not the listener itself.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || e.raw_os_error() == Some(libc::EMFILE)
        || e.raw_os_error() == Some(libc::ENFILE)
}
