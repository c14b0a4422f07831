//! A transport wired to the in-memory bus and registry, and a response body that records what's
//! written to it, for exercising the transport end-to-end through its public interface.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pushpoll_transport::{
    BoxError, CONNECTION_ID_PARAM, ConnectionRegistry, Framing, HookResult, LogicalConnection, MESSAGE_ID_PARAM,
    MessageBus, ObserverRegistration, PersistentTransport, RequestOutcome, ResponseSink, TransportConfig,
    TransportEvent, TransportHooks, TransportObservers, TransportRequest, async_trait,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Ordered record of things that happened, shared between hooks, observers and the test
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == event).count()
    }
}

/// A physical response body that keeps everything written to it
pub struct CapturedResponse {
    content_type: Mutex<Option<String>>,
    writes: watch::Sender<Vec<String>>,
    ended: watch::Sender<bool>,
}

impl CapturedResponse {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            content_type: Mutex::new(None),
            writes: watch::channel(Vec::new()).0,
            ended: watch::channel(false).0,
        })
    }

    pub fn content_type(&self) -> Option<String> {
        self.content_type.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.borrow().clone()
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Wait until at least `count` writes have happened, and return all of them
    pub async fn wait_for_writes(&self, count: usize) -> Vec<String> {
        let mut rx = self.writes.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|writes| writes.len() >= count))
            .await
            .expect("timed out waiting for writes")
            .expect("response dropped")
            .clone()
    }

    /// The JSON payloads of the event stream frames written so far, skipping the preamble
    pub fn frames(&self) -> Vec<serde_json::Value> {
        self.writes()
            .iter()
            .filter_map(|write| write.strip_prefix("data: "))
            .map(|frame| frame.trim_end())
            .filter(|frame| *frame != "initialized")
            .map(|frame| serde_json::from_str(frame).unwrap())
            .collect()
    }
}

#[async_trait]
impl ResponseSink for CapturedResponse {
    fn set_content_type(&self, content_type: &str) {
        *self.content_type.lock().unwrap() = Some(content_type.to_string());
    }

    async fn write(&self, body: String) -> Result<(), BoxError> {
        if *self.ended.borrow() {
            return Err("response already ended".into());
        }
        self.writes.send_modify(|writes| writes.push(body));
        Ok(())
    }

    async fn end(&self) -> Result<(), BoxError> {
        self.ended.send_replace(true);
        Ok(())
    }
}

pub struct TestHarness {
    pub bus: MessageBus,
    pub registry: ConnectionRegistry,
    pub transport: PersistentTransport,
    pub events: EventLog,
    _observer: ObserverRegistration,
}

impl TestHarness {
    /// Build a transport with hooks that record into [`TestHarness::events`]
    pub fn new(config: TransportConfig, framing: impl Framing) -> Self {
        Self::with_hooks(config, framing, |hooks, _| hooks)
    }

    /// Like [`TestHarness::new`], letting the caller adjust the recording hooks before they're
    /// installed
    pub fn with_hooks(
        config: TransportConfig,
        framing: impl Framing,
        customize: impl FnOnce(TransportHooks, EventLog) -> TransportHooks,
    ) -> Self {
        let events = EventLog::default();
        let bus = MessageBus::from_config(&config);
        let registry = ConnectionRegistry::new(bus.clone(), &config);

        let hooks = TransportHooks::new()
            .on_connected(recorder(&events, "connected"))
            .on_reconnected(recorder(&events, "reconnected"))
            .on_disconnected(recorder(&events, "disconnected"))
            .on_received({
                let events = events.clone();
                move |_, data| {
                    let events = events.clone();
                    async move {
                        events.push(format!("received:{data}"));
                        Ok::<(), BoxError>(())
                    }
                }
            });
        let hooks = customize(hooks, events.clone());

        let observers = TransportObservers::new();
        let observer = observers.register({
            let events = events.clone();
            move |event: TransportEvent<'_>| {
                if let TransportEvent::SendingResponse { response, .. } = event {
                    events.push(format!("flush:{}", response.message_id));
                }
            }
        });

        let transport = PersistentTransport::builder()
            .with_backend(bus.clone(), registry.clone())
            .with_config(config)
            .with_hooks(hooks)
            .with_framing(framing)
            .with_observers(observers)
            .build();

        Self {
            bus,
            registry,
            transport,
            events,
            _observer: observer,
        }
    }

    /// Start serving a request in the background
    pub fn spawn(
        &self,
        request: TransportRequest,
    ) -> (
        JoinHandle<pushpoll_transport::Result<RequestOutcome>>,
        Arc<CapturedResponse>,
    ) {
        let response = CapturedResponse::new();
        let transport = self.transport.clone();
        let sink = response.clone();
        let handle = tokio::spawn(async move { transport.process_request(request, sink).await });
        (handle, response)
    }
}

/// A lifecycle hook that records `name` in the log
pub fn recorder(
    events: &EventLog,
    name: &'static str,
) -> impl Fn(LogicalConnection) -> std::future::Ready<HookResult> + Send + Sync + 'static {
    let events = events.clone();
    move |_| {
        events.push(name);
        std::future::ready(Ok(()))
    }
}

/// A physical request to `path` for `connection_id`, resuming after `message_id` if given
pub fn request(path: &str, connection_id: &str, message_id: Option<u64>) -> (TransportRequest, CancellationToken) {
    let token = CancellationToken::new();
    let mut request =
        TransportRequest::new(path, token.clone()).with_query(CONNECTION_ID_PARAM, connection_id);
    if let Some(message_id) = message_id {
        request = request.with_query(MESSAGE_ID_PARAM, message_id.to_string());
    }
    (request, token)
}

pub async fn join(
    handle: JoinHandle<pushpoll_transport::Result<RequestOutcome>>,
) -> pushpoll_transport::Result<RequestOutcome> {
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("request didn't complete in time")
        .expect("request task panicked")
}
