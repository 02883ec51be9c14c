//! Bluetooth Service Module
//!
//! Orchestrator: select a ring, run a session, and decide what happens when
//! it ends.

use crate::domain::error::BridgeError;
use crate::domain::models::{DisconnectReason, SessionState};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::connection::{GattSession, SessionConfig, TelemetrySink};
use crate::infrastructure::bluetooth::scanner::DeviceSelector;
use crate::infrastructure::bluetooth::transport::BleTransport;
use crate::infrastructure::shutdown::Shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// When to start another Selector → Session cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Reconnect after a streaming session drops, and keep trying until the
    /// ring is back
    pub reconnect: bool,
    pub delay: Duration,
    /// Extra attempts for failures before the first streaming session
    pub setup_retries: u32,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            reconnect: settings.reconnect,
            delay: settings.reconnect_delay(),
            setup_retries: settings.setup_retries,
        }
    }
}

pub struct RingService<T: BleTransport> {
    transport: T,
    selector: DeviceSelector,
    session_config: SessionConfig,
    policy: RetryPolicy,
    sink: Arc<dyn TelemetrySink>,
    status: Arc<watch::Sender<SessionState>>,
}

impl<T: BleTransport> RingService<T> {
    pub fn new(
        transport: T,
        settings: &Settings,
        sink: Arc<dyn TelemetrySink>,
    ) -> anyhow::Result<Self> {
        let (status, _) = watch::channel(SessionState::Idle);
        Ok(Self {
            transport,
            selector: DeviceSelector::new(
                settings.default_device_address.clone(),
                Duration::from_secs(settings.scan_timeout_secs),
            ),
            session_config: SessionConfig::from_settings(settings)?,
            policy: RetryPolicy::from_settings(settings),
            sink,
            status: Arc::new(status),
        })
    }

    /// State of the current (or last) session
    pub fn status(&self) -> watch::Receiver<SessionState> {
        self.status.subscribe()
    }

    /// Run sessions until cancelled or the retry policy gives up.
    ///
    /// Cancellation is always `Ok(UserCancelled)`.
    pub async fn run(
        &self,
        identifier: Option<&str>,
        mut shutdown: Shutdown,
    ) -> Result<DisconnectReason, BridgeError> {
        let mut setup_failures = 0u32;
        let mut has_streamed = false;

        loop {
            match self.run_once(identifier, &mut shutdown).await {
                Ok(DisconnectReason::UserCancelled) | Err(BridgeError::Cancelled) => {
                    return Ok(DisconnectReason::UserCancelled);
                }
                Ok(reason) => {
                    has_streamed = true;
                    if !self.policy.reconnect {
                        info!("Session ended ({}), not reconnecting", reason);
                        return Ok(reason);
                    }
                    warn!(
                        "Session ended ({}). Reconnecting in {:.1}s...",
                        reason,
                        self.policy.delay.as_secs_f64()
                    );
                }
                // The ring may be asleep or out of range for a while
                Err(e) if e.is_setup_failure() && has_streamed && self.policy.reconnect => {
                    warn!(
                        "{}. Reconnecting in {:.1}s...",
                        e,
                        self.policy.delay.as_secs_f64()
                    );
                }
                Err(e) if e.is_setup_failure() && setup_failures < self.policy.setup_retries => {
                    setup_failures += 1;
                    warn!(
                        "{}. Retrying in {:.1}s ({}/{})...",
                        e,
                        self.policy.delay.as_secs_f64(),
                        setup_failures,
                        self.policy.setup_retries
                    );
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(DisconnectReason::UserCancelled),
                _ = tokio::time::sleep(self.policy.delay) => {}
            }
        }
    }

    async fn run_once(
        &self,
        identifier: Option<&str>,
        shutdown: &mut Shutdown,
    ) -> Result<DisconnectReason, BridgeError> {
        let device = self
            .selector
            .select(&self.transport, identifier, shutdown)
            .await?;
        let session = GattSession::new(self.session_config.clone(), self.status.clone());
        session
            .run(&self.transport, &device, self.sink.as_ref(), shutdown)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{device, vendor_services, MockLink, MockTransport};
    use crate::infrastructure::bluetooth::protocol::ProtocolIds;
    use crate::infrastructure::bluetooth::transport::LinkEvent;
    use crate::infrastructure::oscquery::publisher::TelemetryPublisher;
    use crate::infrastructure::shutdown;
    use std::sync::atomic::Ordering;

    const RING: &str = "B0:B3:53:EB:40:8D";

    fn settings() -> Settings {
        let mut settings = Settings::default();
        settings.scan_timeout_secs = 2;
        settings.reconnect_delay_secs = 0.01;
        settings.keepalive_interval_secs = 0.0;
        settings
    }

    fn transport(link: &MockLink) -> MockTransport {
        MockTransport::new(link.clone())
            .advertise(Duration::from_millis(1), device(RING, Some("RayNeo X2 Ring")))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_vendor_notification_reaches_published_nodes() {
        let ids = ProtocolIds::default();
        let link = MockLink::new(vendor_services(&ids));
        let events = link.push_stream();
        let publisher = TelemetryPublisher::new();
        let service =
            RingService::new(transport(&link), &settings(), Arc::new(publisher.clone())).unwrap();
        let (trigger, shutdown) = shutdown::channel();
        let mut status = service.status();

        let driver = async {
            status
                .wait_for(|s| *s == SessionState::Streaming)
                .await
                .map(|_| ())
                .unwrap();
            events
                .send(LinkEvent::Notification {
                    characteristic: ids.vendor_notify,
                    value: vec![0x01, 0x02, 0x00, 0x03, 0x00, 0x01],
                })
                .unwrap();
            eventually(|| publisher.snapshot().revision == 1).await;
            trigger.trigger();
        };

        let (outcome, _) = tokio::join!(service.run(None, shutdown), driver);

        assert_eq!(outcome.unwrap(), DisconnectReason::UserCancelled);
        let snapshot = publisher.snapshot();
        assert_eq!((snapshot.x, snapshot.y, snapshot.press), (2, 3, true));
        assert!(!link.is_connected());
        assert_eq!(link.count("disconnect"), 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_peer_disconnect() {
        let ids = ProtocolIds::default();
        let link = MockLink::new(vendor_services(&ids));
        link.push_stream().send(LinkEvent::Disconnected).unwrap();
        let _second = link.push_stream();
        let service = RingService::new(
            transport(&link),
            &settings(),
            Arc::new(TelemetryPublisher::new()),
        )
        .unwrap();
        let (trigger, shutdown) = shutdown::channel();

        let driver = async {
            eventually(|| link.count("subscribe") == 2).await;
            trigger.trigger();
        };
        let (outcome, _) = tokio::join!(service.run(None, shutdown), driver);

        assert_eq!(outcome.unwrap(), DisconnectReason::UserCancelled);
        assert_eq!(service.transport.scans.load(Ordering::SeqCst), 2);
        assert_eq!(link.count("disconnect"), 2);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_scanning_for_a_missing_ring() {
        let ids = ProtocolIds::default();
        let link = MockLink::new(vendor_services(&ids));
        link.push_stream().send(LinkEvent::Disconnected).unwrap();
        // Seen on the first scan only, then gone
        let transport = transport(&link).advertise_for_scans(1);
        let service =
            RingService::new(transport, &settings(), Arc::new(TelemetryPublisher::new())).unwrap();
        let (trigger, shutdown) = shutdown::channel();

        let driver = async {
            eventually(|| service.transport.scans.load(Ordering::SeqCst) >= 4).await;
            trigger.trigger();
        };
        let (outcome, _) = tokio::join!(service.run(None, shutdown), driver);

        assert_eq!(outcome.unwrap(), DisconnectReason::UserCancelled);
        assert_eq!(link.count("connect"), 1);
    }

    #[tokio::test]
    async fn test_missing_ring_on_first_attempt_is_returned() {
        let link = MockLink::default();
        let transport = transport(&link).advertise_for_scans(0);
        let service =
            RingService::new(transport, &settings(), Arc::new(TelemetryPublisher::new())).unwrap();
        let (_trigger, shutdown) = shutdown::channel();

        let err = service.run(None, shutdown).await.unwrap_err();

        assert!(matches!(err, BridgeError::DeviceNotFound { .. }));
        assert_eq!(service.transport.scans.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_reconnect_returns_reason() {
        let ids = ProtocolIds::default();
        let link = MockLink::new(vendor_services(&ids));
        link.push_stream().send(LinkEvent::Disconnected).unwrap();
        let mut settings = settings();
        settings.reconnect = false;
        let service =
            RingService::new(transport(&link), &settings, Arc::new(TelemetryPublisher::new()))
                .unwrap();
        let (_trigger, shutdown) = shutdown::channel();

        let outcome = service.run(None, shutdown).await;

        assert_eq!(outcome.unwrap(), DisconnectReason::PeerDisconnected);
        assert_eq!(link.count("connect"), 1);
    }

    #[tokio::test]
    async fn test_setup_failure_retried_then_returned() {
        let link = MockLink::default();
        let mut settings = settings();
        settings.setup_retries = 2;
        let transport = transport(&link).refuse_connect("le-connection-abort-by-local");
        let service =
            RingService::new(transport, &settings, Arc::new(TelemetryPublisher::new())).unwrap();
        let (_trigger, shutdown) = shutdown::channel();

        let err = service.run(None, shutdown).await.unwrap_err();

        assert!(matches!(err, BridgeError::Connection(_)));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(service.transport.connects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_setup_failure_without_retries() {
        let link = MockLink::new(Vec::new());
        let service = RingService::new(
            transport(&link),
            &settings(),
            Arc::new(TelemetryPublisher::new()),
        )
        .unwrap();
        let (_trigger, shutdown) = shutdown::channel();

        let err = service.run(None, shutdown).await.unwrap_err();

        assert!(matches!(err, BridgeError::ServiceNotFound(_)));
        assert_eq!(link.count("connect"), 1);
        assert_eq!(link.count("disconnect"), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let ids = ProtocolIds::default();
        let link = MockLink::new(vendor_services(&ids));
        link.push_stream().send(LinkEvent::Disconnected).unwrap();
        let mut settings = settings();
        settings.reconnect_delay_secs = 60.0;
        let service =
            RingService::new(transport(&link), &settings, Arc::new(TelemetryPublisher::new()))
                .unwrap();
        let (trigger, shutdown) = shutdown::channel();
        let status = service.status();

        let driver = async {
            eventually(|| matches!(*status.borrow(), SessionState::Disconnected(_))).await;
            trigger.trigger();
        };
        let (outcome, _) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(service.run(None, shutdown), driver)
        })
        .await
        .unwrap();

        assert_eq!(outcome.unwrap(), DisconnectReason::UserCancelled);
        assert_eq!(link.count("connect"), 1);
    }

    #[test]
    fn test_retry_policy_from_settings() {
        let mut settings = Settings::default();
        settings.setup_retries = 4;
        let policy = RetryPolicy::from_settings(&settings);
        assert!(policy.reconnect);
        assert_eq!(policy.delay, Duration::from_secs(3));
        assert_eq!(policy.setup_retries, 4);
    }
}
