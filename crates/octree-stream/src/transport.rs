use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::error::TransportError;

/// Best-effort datagram sink. Sends never block the calling worker; a full
/// socket buffer is reported as [`TransportError::WouldBlock`] and treated
/// like loss on the wire.
pub trait DatagramTransport: Send + Sync + 'static {
    fn send_datagram(&self, to: SocketAddr, datagram: &Bytes) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }
}

impl DatagramTransport for UdpTransport {
    fn send_datagram(&self, to: SocketAddr, datagram: &Bytes) -> Result<(), TransportError> {
        match self.socket.try_send_to(datagram, to) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(TransportError::WouldBlock),
            Err(err) => Err(TransportError::Io(err)),
        }
    }
}

pub mod mock {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};

    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::DatagramTransport;
    use crate::error::TransportError;

    /// Captures every datagram handed to it.
    #[derive(Debug, Default)]
    pub struct MockTransport {
        sent: Mutex<Vec<(SocketAddr, Bytes)>>,
        fail_sends: AtomicBool,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sent(&self) -> Vec<(SocketAddr, Bytes)> {
            self.sent.lock().clone()
        }

        pub fn sent_to(&self, addr: SocketAddr) -> Vec<Bytes> {
            self.sent
                .lock()
                .iter()
                .filter(|(to, _)| *to == addr)
                .map(|(_, datagram)| datagram.clone())
                .collect()
        }

        pub fn take(&self) -> Vec<(SocketAddr, Bytes)> {
            std::mem::take(&mut *self.sent.lock())
        }

        pub fn len(&self) -> usize {
            self.sent.lock().len()
        }

        pub fn is_empty(&self) -> bool {
            self.sent.lock().is_empty()
        }

        /// Makes subsequent sends fail as if the socket buffer were full.
        pub fn set_failing(&self, failing: bool) {
            self.fail_sends.store(failing, Ordering::SeqCst);
        }
    }

    impl DatagramTransport for MockTransport {
        fn send_datagram(&self, to: SocketAddr, datagram: &Bytes) -> Result<(), TransportError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(TransportError::WouldBlock);
            }
            self.sent.lock().push((to, datagram.clone()));
            Ok(())
        }
    }
}
