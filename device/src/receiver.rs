use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::dispatch::CommandDispatcher;
use crate::error::Result;

pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_DATAGRAM: usize = 2048;

pub struct Receiver {
    socket: Arc<UdpSocket>,
    dispatcher: Arc<CommandDispatcher>,
    shutdown: watch::Receiver<bool>,
}

impl Receiver {
    pub fn new(
        socket: Arc<UdpSocket>,
        dispatcher: Arc<CommandDispatcher>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            socket,
            dispatcher,
            shutdown,
        }
    }

    /// Runs until shutdown (`Ok`) or a socket error other than a poll
    /// timeout (`Err`). Bad datagrams are logged and skipped.
    pub async fn run(self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            if *self.shutdown.borrow() {
                info!("Receiver stopping");
                return Ok(());
            }

            let (len, from) = match timeout(POLL_INTERVAL, self.socket.recv_from(&mut buf)).await {
                Err(_) => continue,
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    error!(error = %e, "Receiver socket error, stopping receiver");
                    return Err(e.into());
                }
            };
            if len == 0 {
                continue;
            }

            if let Err(e) = self.dispatcher.dispatch(&buf[..len]).await {
                warn!(from = %from, error = %e, "Receiver error");
            }
        }
    }
}
