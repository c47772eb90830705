//! Scripted in-process transport for tests.

use super::{Transport, TransportError, TransportRequest, TransportResult};
use crate::factory::{FactoryError, ProviderSettings, TransportFactory};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

type SendHook = Arc<dyn Fn(&TransportRequest) + Send + Sync>;

#[derive(Default)]
struct MockState {
    outcomes: VecDeque<Result<TransportResult, TransportError>>,
    sent: Vec<TransportRequest>,
    calls: usize,
    verify_error: Option<TransportError>,
    verify_calls: usize,
    delay: Option<Duration>,
    on_send: Option<SendHook>,
}

/// Scripted transport. Clones share state, so a test can keep a handle
/// while the reconciler owns another.
///
/// Outcomes are consumed in order; once the script runs out every call
/// succeeds with `mock-<n>`.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push_success(&self, message_id: impl Into<String>) -> &Self {
        self.state()
            .outcomes
            .push_back(Ok(TransportResult::accepted(message_id)));
        self
    }

    pub fn push_failure(&self, error: TransportError) -> &Self {
        self.state().outcomes.push_back(Err(error));
        self
    }

    /// Every call sleeps this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    pub fn set_verify_error(&self, error: Option<TransportError>) {
        self.state().verify_error = error;
    }

    /// Runs inside `send`, before the outcome is returned.
    pub fn on_send(&self, hook: impl Fn(&TransportRequest) + Send + Sync + 'static) {
        self.state().on_send = Some(Arc::new(hook));
    }

    pub fn calls(&self) -> usize {
        self.state().calls
    }

    pub fn verify_calls(&self) -> usize {
        self.state().verify_calls
    }

    pub fn sent(&self) -> Vec<TransportRequest> {
        self.state().sent.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &TransportRequest) -> Result<TransportResult, TransportError> {
        let (delay, hook) = {
            let mut state = self.state();
            state.calls += 1;
            (state.delay, state.on_send.clone())
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(hook) = hook {
            hook(request);
        }

        let mut state = self.state();
        let outcome = match state.outcomes.pop_front() {
            Some(outcome) => outcome,
            None => Ok(TransportResult::accepted(format!("mock-{}", state.calls))),
        };
        if outcome.is_ok() {
            state.sent.push(request.clone());
        }
        outcome
    }

    async fn verify_credentials(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.verify_calls += 1;
        match &state.verify_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Hands out clones of one [`MockTransport`] after the same parameter
/// checks the real factory makes.
#[derive(Clone, Default)]
pub struct MockTransportFactory {
    transport: MockTransport,
    builds: Arc<Mutex<Vec<ProviderSettings>>>,
}

impl MockTransportFactory {
    pub fn new(transport: MockTransport) -> Self {
        Self {
            transport,
            builds: Arc::default(),
        }
    }

    pub fn transport(&self) -> &MockTransport {
        &self.transport
    }

    /// Settings of every successful build, in order.
    pub fn builds(&self) -> Vec<ProviderSettings> {
        self.builds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl TransportFactory for MockTransportFactory {
    type Transport = MockTransport;

    fn build(&self, settings: &ProviderSettings) -> Result<MockTransport, FactoryError> {
        settings.validate()?;
        self.builds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(settings.clone());
        Ok(self.transport.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn request() -> TransportRequest {
        TransportRequest {
            message_id: "m".into(),
            from: "a@b.c".into(),
            from_name: None,
            to: "d@e.f".into(),
            to_name: None,
            subject: "s".into(),
            text_body: "b".into(),
            html_body: None,
            reply_to: None,
            cc: Vec::new(),
            bcc: Vec::new(),
            headers: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_script_then_default_success() {
        let transport = MockTransport::new();
        transport
            .push_failure(TransportError::transient("busy"))
            .push_success("first");

        assert!(transport.send(&request()).await.is_err());
        assert_eq!(transport.send(&request()).await.unwrap().message_id, "first");
        assert_eq!(transport.send(&request()).await.unwrap().message_id, "mock-3");
        assert_eq!(transport.calls(), 3);
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let transport = MockTransport::new();
        let handle = transport.clone();
        transport.send(&request()).await.unwrap();
        assert_eq!(handle.calls(), 1);
    }
}
