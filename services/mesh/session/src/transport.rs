//! Bearer port and an in-memory loopback bearer.
//!
//! A bearer moves opaque proxy PDUs (at most `mtu_size()` octets each) between
//! this engine and a peer. Inbound PDUs are pushed into the engine with
//! `MeshManager::on_raw_pdu_received`.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::MeshError;

/// Outbound half of a connection to a mesh proxy or device
#[async_trait]
pub trait Bearer: Send + Sync {
    /// Write one proxy PDU
    async fn send_raw_pdu(&self, pdu: Bytes) -> Result<(), MeshError>;

    /// Largest PDU the connection accepts
    fn mtu_size(&self) -> usize;

    /// Close the connection
    async fn close(&self) {}
}

/// One end of a loopback connection
pub struct LoopbackEnd {
    /// Bearer writing to the peer
    pub bearer: LoopbackBearer,
    /// PDUs written by the peer
    pub inbound: mpsc::UnboundedReceiver<Bytes>,
}

/// Bearer that hands PDUs to a channel read by the peer engine
#[derive(Debug)]
pub struct LoopbackBearer {
    peer: mpsc::UnboundedSender<Bytes>,
    mtu: usize,
    closed: AtomicBool,
}

impl LoopbackBearer {
    /// Two connected ends sharing an MTU
    pub fn pair(mtu: usize) -> (LoopbackEnd, LoopbackEnd) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = LoopbackEnd {
            bearer: LoopbackBearer {
                peer: b_tx,
                mtu,
                closed: AtomicBool::new(false),
            },
            inbound: a_rx,
        };
        let b = LoopbackEnd {
            bearer: LoopbackBearer {
                peer: a_tx,
                mtu,
                closed: AtomicBool::new(false),
            },
            inbound: b_rx,
        };
        (a, b)
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Bearer for LoopbackBearer {
    async fn send_raw_pdu(&self, pdu: Bytes) -> Result<(), MeshError> {
        if self.is_closed() {
            return Err(MeshError::Bearer("connection closed".to_string()));
        }
        if pdu.len() > self.mtu {
            return Err(MeshError::Bearer(format!(
                "PDU of {} octets exceeds MTU {}",
                pdu.len(),
                self.mtu
            )));
        }
        trace!(len = pdu.len(), "Loopback write");
        self.peer
            .send(pdu)
            .map_err(|_| MeshError::Bearer("peer gone".to_string()))
    }

    fn mtu_size(&self) -> usize {
        self.mtu
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Loopback bearer closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_pair() {
        let (a, mut b) = LoopbackBearer::pair(23);
        a.bearer
            .send_raw_pdu(Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(b.inbound.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(a.bearer.mtu_size(), 23);
    }

    #[tokio::test]
    async fn test_loopback_enforces_mtu_and_close() {
        let (a, _b) = LoopbackBearer::pair(4);
        assert!(a
            .bearer
            .send_raw_pdu(Bytes::from_static(b"too long"))
            .await
            .is_err());

        a.bearer.close().await;
        assert!(a.bearer.is_closed());
        assert!(matches!(
            a.bearer.send_raw_pdu(Bytes::from_static(b"x")).await,
            Err(MeshError::Bearer(_))
        ));
    }
}
