//! Request/response correlation with resend.
//!
//! Every outbound exchange (connection request, heartbeat probe, data
//! request) sends its request, resends it on a fixed interval, and waits for
//! the first response its matcher accepts, the deadline, or cancellation.
//! Responses routed by the dispatch loop reach an exchange through a
//! [`Pending`] slot registered for that exchange alone.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use knx_wire::Message;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, TunnelError};
use crate::transport::{InboundMessages, Transport};

/// Responses buffered for one registered exchange
const PENDING_CAPACITY: usize = 4;

/// Hand-off point between the dispatch loop and the exchange currently
/// waiting for a given response type. Every registration gets a fresh
/// channel; responses left over from an earlier exchange die with it.
pub(crate) struct Pending<T> {
    waiter: Arc<Mutex<Option<mpsc::Sender<T>>>>,
}

impl<T> Clone for Pending<T> {
    fn clone(&self) -> Self {
        Self {
            waiter: self.waiter.clone(),
        }
    }
}

impl<T> Pending<T> {
    pub fn new() -> Self {
        Self {
            waiter: Arc::new(Mutex::new(None)),
        }
    }

    /// Register a new exchange, replacing any earlier one
    pub fn register(&self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(PENDING_CAPACITY);
        *self.waiter.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    /// Sender of the exchange still waiting, if any
    pub fn waiter(&self) -> Option<mpsc::Sender<T>> {
        self.waiter
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|tx| !tx.is_closed())
            .cloned()
    }
}

/// Outcome of matching one candidate response
#[derive(Debug)]
pub(crate) enum Verdict<R> {
    /// The exchange completes with this value
    Accept(R),
    /// The exchange fails with this error
    Reject(TunnelError),
    /// Not a response to this exchange; keep waiting
    Ignore,
}

/// Source of candidate responses
pub(crate) trait Responses<M> {
    async fn recv(&mut self) -> Option<M>;
}

impl<M> Responses<M> for mpsc::Receiver<M> {
    async fn recv(&mut self) -> Option<M> {
        mpsc::Receiver::recv(self).await
    }
}

impl Responses<Message> for InboundMessages {
    async fn recv(&mut self) -> Option<Message> {
        self.next().await
    }
}

/// Parameters of one exchange
pub(crate) struct Exchange<'a> {
    pub transport: &'a dyn Transport,
    pub cancel: &'a CancellationToken,
    pub resend_interval: Duration,
    pub timeout: Duration,
    /// Name of the awaited response, used in logs and `Timeout`
    pub what: &'static str,
}

impl Exchange<'_> {
    /// Send `request` and wait for a response accepted by `matcher`
    pub async fn run<S, M, R, F>(&self, request: Message, responses: &mut S, mut matcher: F) -> Result<R>
    where
        S: Responses<M>,
        F: FnMut(M) -> Verdict<R>,
    {
        self.transport.send(request.clone()).await?;

        let deadline = sleep(self.timeout);
        tokio::pin!(deadline);

        let mut resend = interval_at(Instant::now() + self.resend_interval, self.resend_interval);
        resend.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempts = 1u32;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Err(TunnelError::Cancelled),

                _ = &mut deadline => {
                    debug!("No {} after {} attempts", self.what, attempts);
                    return Err(TunnelError::Timeout(self.what));
                }

                response = responses.recv() => {
                    let Some(response) = response else {
                        return Err(TunnelError::TransportClosed);
                    };
                    match matcher(response) {
                        Verdict::Accept(value) => return Ok(value),
                        Verdict::Reject(err) => return Err(err),
                        Verdict::Ignore => {}
                    }
                }

                _ = resend.tick() => {
                    attempts += 1;
                    debug!("Resending {:?} (attempt {})", request.service(), attempts);
                    self.transport.send(request.clone()).await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::channel_pair;
    use knx_wire::{Status, TunnellingAck};

    fn ack(sequence: u8, status: Status) -> TunnellingAck {
        TunnellingAck {
            channel: 1,
            sequence,
            status,
        }
    }

    fn exchange<'a>(transport: &'a dyn Transport, cancel: &'a CancellationToken) -> Exchange<'a> {
        Exchange {
            transport,
            cancel,
            resend_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(2),
            what: "ack",
        }
    }

    fn match_seq(expected: u8) -> impl FnMut(TunnellingAck) -> Verdict<Status> {
        move |ack: TunnellingAck| {
            if ack.sequence != expected {
                Verdict::Ignore
            } else if ack.status.is_ok() {
                Verdict::Accept(ack.status)
            } else {
                Verdict::Reject(TunnelError::RequestRejected(ack.status))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resends_until_deadline() {
        let (transport, mut peer) = channel_pair(16);
        let cancel = CancellationToken::new();
        let (_tx, mut rx) = mpsc::channel::<TunnellingAck>(1);

        let started = Instant::now();
        let result = exchange(&transport, &cancel)
            .run(ack(0, Status::NO_ERROR).into(), &mut rx, match_seq(0))
            .await;

        assert!(matches!(result, Err(TunnelError::Timeout("ack"))));
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_millis(2100));

        transport.close().await;
        let mut sent = 0;
        while peer.recv().await.is_some() {
            sent += 1;
        }
        assert!((3..=4).contains(&sent), "sent {} times", sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignores_mismatch_then_accepts() {
        let (transport, _peer) = channel_pair(16);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);

        tx.send(ack(7, Status::NO_ERROR)).await.unwrap();
        tx.send(ack(3, Status::NO_ERROR)).await.unwrap();

        let result = exchange(&transport, &cancel)
            .run(ack(3, Status::NO_ERROR).into(), &mut rx, match_seq(3))
            .await;
        assert_eq!(result.unwrap(), Status::NO_ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_and_cancel() {
        let (transport, _peer) = channel_pair(16);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(4);

        tx.send(ack(0, Status(0x29))).await.unwrap();
        let result = exchange(&transport, &cancel)
            .run(ack(0, Status::NO_ERROR).into(), &mut rx, match_seq(0))
            .await;
        assert!(matches!(result, Err(TunnelError::RequestRejected(Status(0x29)))));

        cancel.cancel();
        let result = exchange(&transport, &cancel)
            .run(ack(1, Status::NO_ERROR).into(), &mut rx, match_seq(1))
            .await;
        assert!(matches!(result, Err(TunnelError::Cancelled)));
    }

    #[tokio::test]
    async fn test_pending_drops_responses_of_finished_exchange() {
        let pending = Pending::new();
        assert!(pending.waiter().is_none());

        let mut first = pending.register();
        let tx = pending.waiter().unwrap();
        tx.send(ack(0, Status::NO_ERROR)).await.unwrap();
        tx.send(ack(0, Status::NO_ERROR)).await.unwrap();
        assert_eq!(first.recv().await.unwrap().sequence, 0);
        drop(first);

        // a duplicate still in flight cannot reach the next exchange
        assert!(tx.send(ack(0, Status::NO_ERROR)).await.is_err());
        assert!(pending.waiter().is_none());

        let mut second = pending.register();
        assert!(second.try_recv().is_err());
        pending
            .waiter()
            .unwrap()
            .send(ack(1, Status::NO_ERROR))
            .await
            .unwrap();
        assert_eq!(second.recv().await.unwrap().sequence, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_response_source() {
        let (transport, _peer) = channel_pair(16);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<TunnellingAck>(1);
        drop(tx);

        let result = exchange(&transport, &cancel)
            .run(ack(0, Status::NO_ERROR).into(), &mut rx, match_seq(0))
            .await;
        assert!(matches!(result, Err(TunnelError::TransportClosed)));
    }
}
