//! Outbound message dispatch under a bounded send semaphore.
//!
//! Every outbound path (fan-out of a local join, reconnect bootstrap, sync
//! queries and replies) goes through [`Dispatcher::send`]: encode, acquire
//! one permit from the bounded semaphore, hand the bytes to the transport.
//! The permit is held for the duration of the transport send only, which
//! bounds in-flight sends per manager and gives callers backpressure.
//!
//! Transport send failure is silent at this layer. A dropped connection
//! means the peer will be re-bootstrapped on reconnect, so there is nothing
//! useful to do with the error here.

use crate::config::Tag;
use crate::error::{MeshError, Result};
use crate::metrics;
use crate::transport::{Connection, Transport};
use crate::wire::{Message, WireEncode};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Encodes and sends protocol messages under the outbound permit.
pub struct Dispatcher<T> {
    transport: Arc<T>,
    tag: Tag,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            tag: self.tag,
            permits: Arc::clone(&self.permits),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T: Transport> Dispatcher<T> {
    pub(crate) fn new(
        transport: Arc<T>,
        tag: Tag,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            tag,
            permits: Arc::new(Semaphore::new(capacity)),
            shutdown,
        }
    }

    /// Number of currently free permits. Test and diagnostic hook.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Encode `message` and send it on `connection`.
    ///
    /// Blocks only while waiting for a permit; that wait races the caller's
    /// `interrupt`, the manager shutdown drain, and the connection drain.
    /// A drained connection or a transport-reported failure resolves to
    /// `Ok(())`: the message is dropped and the peer recovers via the
    /// reconnect bootstrap.
    pub async fn send<M: WireEncode>(
        &self,
        connection: &Connection,
        message: &Message<M>,
        interrupt: &CancellationToken,
    ) -> Result<()> {
        let frame = message.encode(self.transport.wire_version());
        let wait_started = Instant::now();

        let _permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.expect("outbound semaphore never closed")
            }
            _ = interrupt.cancelled() => return Err(MeshError::Interrupted),
            _ = self.shutdown.cancelled() => return Err(MeshError::ManagerGone),
            _ = connection.closed().cancelled() => {
                trace!(peer_id = %connection.peer(), kind = message.kind(),
                       "Connection drained before send; dropping message");
                return Ok(());
            }
        };
        metrics::record_permit_wait(wait_started.elapsed());

        if let Err(e) = self
            .transport
            .send(connection, self.tag, frame)
            .await
        {
            debug!(peer_id = %connection.peer(), kind = message.kind(), error = %e,
                   "Transport send failed; dropping message");
            metrics::record_send_dropped(connection.peer().as_str());
        }
        Ok(())
    }
}
