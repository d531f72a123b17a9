//! Frame hand-off between the packet pump and the stack driver

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::NetworkProtocol;
use crate::error::StackError;

/// Inbound frame tagged with its network-layer protocol
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub protocol: NetworkProtocol,
    pub data: Bytes,
}

/// Injects frames into the stack
#[derive(Debug, Clone)]
pub struct LinkInjector {
    tx: mpsc::Sender<InboundFrame>,
}

impl LinkInjector {
    /// Queue a frame for the stack, waiting if the queue is full
    ///
    /// # Errors
    ///
    /// Returns `StackError::Closed` once the stack task has stopped.
    pub async fn inject_inbound(
        &self,
        protocol: NetworkProtocol,
        frame: Bytes,
    ) -> Result<(), StackError> {
        self.tx
            .send(InboundFrame {
                protocol,
                data: frame,
            })
            .await
            .map_err(|_| StackError::Closed)
    }
}

/// Yields frames the stack produced
#[derive(Debug)]
pub struct LinkReader {
    rx: mpsc::Receiver<Bytes>,
}

impl LinkReader {
    /// Next outbound frame
    ///
    /// Returns `None` when `cancel` fires or the stack has stopped.
    pub async fn read_outbound(&mut self, cancel: &CancellationToken) -> Option<Bytes> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            frame = self.rx.recv() => frame,
        }
    }
}

/// Link-layer handle of a stack
#[derive(Debug)]
pub struct LinkEndpoint {
    injector: LinkInjector,
    reader: LinkReader,
    mtu: usize,
}

impl LinkEndpoint {
    pub(crate) fn new(
        inbound: mpsc::Sender<InboundFrame>,
        outbound: mpsc::Receiver<Bytes>,
        mtu: usize,
    ) -> Self {
        Self {
            injector: LinkInjector { tx: inbound },
            reader: LinkReader { rx: outbound },
            mtu,
        }
    }

    #[must_use]
    pub const fn mtu(&self) -> usize {
        self.mtu
    }

    /// See [`LinkInjector::inject_inbound`]
    ///
    /// # Errors
    ///
    /// Returns `StackError::Closed` once the stack task has stopped.
    pub async fn inject_inbound(
        &self,
        protocol: NetworkProtocol,
        frame: Bytes,
    ) -> Result<(), StackError> {
        self.injector.inject_inbound(protocol, frame).await
    }

    /// See [`LinkReader::read_outbound`]
    pub async fn read_outbound(&mut self, cancel: &CancellationToken) -> Option<Bytes> {
        self.reader.read_outbound(cancel).await
    }

    /// Separate the two directions for use from different tasks
    #[must_use]
    pub fn split(self) -> (LinkInjector, LinkReader) {
        (self.injector, self.reader)
    }
}
