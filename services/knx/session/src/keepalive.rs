//! Heartbeat monitor.
//!
//! After `heartbeat_delay` without inbound traffic the monitor probes the
//! gateway with a connection-state request. A normal answer returns it to
//! idle; a bad state or no answer is reported once as a heartbeat failure and
//! the monitor stops.

use std::sync::Arc;

use knx_wire::{ConnectionStateRequest, ConnectionStateResponse, HostInfo, Message, Status};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{Result, TunnelError};
use crate::exchange::{Exchange, Pending, Verdict};
use crate::session::TunnelConfig;
use crate::transport::Transport;

/// Liveness monitor for one established channel
pub(crate) struct HeartbeatMonitor {
    pub transport: Arc<dyn Transport>,
    pub channel: u8,
    pub config: TunnelConfig,
    /// One message per burst of inbound traffic
    pub activity: mpsc::Receiver<()>,
    /// Connection-state responses forwarded by the dispatch loop
    pub responses: Pending<ConnectionStateResponse>,
    pub failures: mpsc::Sender<TunnelError>,
    pub cancel: CancellationToken,
}

impl HeartbeatMonitor {
    /// Run until cancelled or until the gateway stops answering
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return,

                seen = self.activity.recv() => {
                    if seen.is_none() {
                        return;
                    }
                    continue;
                }

                _ = sleep(self.config.heartbeat_delay) => {}
            }

            match self.probe().await {
                Ok(()) => debug!("Channel {} alive", self.channel),
                Err(TunnelError::Cancelled) => return,
                Err(e) => {
                    error!("Heartbeat on channel {} failed: {}", self.channel, e);
                    let _ = self.failures.try_send(TunnelError::HeartbeatFailed(Box::new(e)));
                    return;
                }
            }
        }
    }

    async fn probe(&self) -> Result<()> {
        debug!("Probing channel {} after {:?} of silence", self.channel, self.config.heartbeat_delay);

        let channel = self.channel;
        let request = Message::from(ConnectionStateRequest {
            channel,
            status: Status::NO_ERROR,
            control: HostInfo::nat(),
        });

        let exchange = Exchange {
            transport: &*self.transport,
            cancel: &self.cancel,
            resend_interval: self.config.resend_interval,
            timeout: self.config.response_timeout,
            what: "connection state response",
        };

        let mut responses = self.responses.register();
        exchange
            .run(request, &mut responses, |res: ConnectionStateResponse| {
                if res.channel != channel {
                    Verdict::Ignore
                } else if res.status.is_ok() {
                    Verdict::Accept(())
                } else {
                    Verdict::Reject(TunnelError::ConnectionState(res.status))
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{channel_pair, ChannelPeer};
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::Instant;

    struct Harness {
        peer: ChannelPeer,
        activity: mpsc::Sender<()>,
        responses: Pending<ConnectionStateResponse>,
        failures: mpsc::Receiver<TunnelError>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    }

    fn start(config: TunnelConfig) -> Harness {
        let (transport, peer) = channel_pair(64);
        let (activity, activity_rx) = mpsc::channel(1);
        let responses = Pending::new();
        let (failures_tx, failures) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let monitor = HeartbeatMonitor {
            transport: Arc::new(transport),
            channel: 5,
            config,
            activity: activity_rx,
            responses: responses.clone(),
            failures: failures_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(monitor.run());

        Harness {
            peer,
            activity,
            responses,
            failures,
            cancel,
            task,
        }
    }

    impl Harness {
        /// Answer the probe currently waiting
        async fn answer(&self, status: Status) {
            self.responses
                .waiter()
                .unwrap()
                .send(ConnectionStateResponse { channel: 5, status })
                .await
                .unwrap();
        }
    }

    fn config() -> TunnelConfig {
        TunnelConfig {
            heartbeat_delay: Duration::from_secs(10),
            response_timeout: Duration::from_secs(2),
            ..TunnelConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_after_silence() {
        let mut h = start(config());
        let started = Instant::now();

        let probe = h.peer.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(matches!(
            probe,
            Message::ConnectionStateRequest(ConnectionStateRequest { channel: 5, .. })
        ));

        h.answer(Status::NO_ERROR).await;

        // back to idle, next probe after another full delay
        let second = Instant::now();
        h.peer.recv().await.unwrap();
        assert!(second.elapsed() >= Duration::from_secs(10));
        assert!(h.failures.try_recv().is_err());

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_answer_does_not_satisfy_next_heartbeat() {
        let mut h = start(config());
        let started = Instant::now();

        h.peer.recv().await.unwrap();
        let answer = ConnectionStateResponse { channel: 5, status: Status::NO_ERROR };
        let tx = h.responses.waiter().unwrap();
        tx.send(answer).await.unwrap();
        let _ = tx.send(answer).await;

        let failure = h.failures.recv().await.unwrap();
        assert!(matches!(failure, TunnelError::HeartbeatFailed(_)));
        // second heartbeat at 20s, unanswered for the 2s response timeout
        assert!(started.elapsed() >= Duration::from_secs(22));
        assert!(started.elapsed() < Duration::from_secs(23));
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_defers_probe() {
        let mut h = start(config());
        let started = Instant::now();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(6)).await;
            h.activity.send(()).await.unwrap();
        }

        h.peer.recv().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(28));

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_state_fails() {
        let mut h = start(config());
        h.peer.recv().await.unwrap();
        h.answer(Status::CONNECTION_ID).await;

        let failure = h.failures.recv().await.unwrap();
        match failure {
            TunnelError::HeartbeatFailed(cause) => assert!(matches!(
                *cause,
                TunnelError::ConnectionState(Status::CONNECTION_ID)
            )),
            other => panic!("unexpected {:?}", other),
        }
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_gateway_fails() {
        let mut h = start(config());
        let failure = h.failures.recv().await.unwrap();
        match failure {
            TunnelError::HeartbeatFailed(cause) => {
                assert!(matches!(*cause, TunnelError::Timeout(_)))
            }
            other => panic!("unexpected {:?}", other),
        }
        h.task.await.unwrap();

        // initial probe plus resends; the transport is dropped with the monitor
        let mut probes = 0;
        while h.peer.recv().await.is_some() {
            probes += 1;
        }
        assert!(probes >= 2);
    }
}
