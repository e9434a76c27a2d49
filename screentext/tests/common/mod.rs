#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use screentext::engine::{
    ChannelConnector, EngineSettings, HealthCheck, OcrAdapterStatus, OcrEngineAdapter,
    RecognitionChannel, RecognitionRequest, RecognitionResult, ServiceOptions,
};
use screentext::error::{OcrError, Result};

/// Service stand-in. Each recognition waits for one permit and answers with
/// the image bytes read back as text.
pub struct MockChannel {
    pub permits: Semaphore,
    pub recognized: Mutex<Vec<String>>,
    pub settings_pushed: Mutex<Vec<EngineSettings>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub fail_recognition: AtomicBool,
    pub fail_settings: AtomicBool,
}

impl MockChannel {
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            permits: Semaphore::new(0),
            recognized: Mutex::new(Vec::new()),
            settings_pushed: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fail_recognition: AtomicBool::new(false),
            fail_settings: AtomicBool::new(false),
        })
    }

    pub fn open() -> Arc<Self> {
        let channel = Self::gated();
        channel.release(1_000);
        channel
    }

    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    pub fn recognized(&self) -> Vec<String> {
        self.recognized.lock().unwrap().clone()
    }

    pub fn settings_pushes(&self) -> usize {
        self.settings_pushed.lock().unwrap().len()
    }
}

#[async_trait]
impl RecognitionChannel for MockChannel {
    async fn recognize_bytes(
        &self,
        _id: &str,
        image_bytes: &[u8],
        _language_code: &str,
    ) -> Result<RecognitionResult> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
        tokio::task::yield_now().await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let text = String::from_utf8_lossy(image_bytes).to_string();
        self.recognized.lock().unwrap().push(text.clone());

        if self.fail_recognition.load(Ordering::SeqCst) {
            return Err(OcrError::Rpc("connection reset".to_string()));
        }
        Ok(RecognitionResult::from_text(text))
    }

    async fn supported_languages(&self) -> Result<Vec<String>> {
        Ok(vec!["en".to_string(), "ja".to_string()])
    }

    async fn update_settings(&self, settings: &EngineSettings) -> Result<()> {
        self.settings_pushed.lock().unwrap().push(settings.clone());
        if self.fail_settings.load(Ordering::SeqCst) {
            return Err(OcrError::Rpc("settings endpoint down".to_string()));
        }
        Ok(())
    }
}

/// Hands out the same [`MockChannel`] on every connect.
pub struct MockConnector {
    pub channel: Arc<MockChannel>,
    pub connects: AtomicUsize,
    pub refuse: AtomicBool,
}

impl MockConnector {
    pub fn new(channel: Arc<MockChannel>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            connects: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelConnector for MockConnector {
    async fn connect(&self, _address: &str) -> Result<Arc<dyn RecognitionChannel>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(OcrError::Rpc("connection refused".to_string()));
        }
        Ok(self.channel.clone())
    }
}

pub fn service_options(connector: Arc<MockConnector>) -> ServiceOptions {
    ServiceOptions {
        process: None,
        address: Some("127.0.0.1:7001".to_string()),
        connector,
        health: HealthCheck::new(Duration::from_secs(2), 15),
        settings_retry_limit: 3,
        settings: EngineSettings::default(),
    }
}

/// A started service adapter bound to `channel`.
pub async fn started_adapter(channel: Arc<MockChannel>) -> (OcrEngineAdapter, Arc<MockConnector>) {
    let connector = MockConnector::new(channel);
    let adapter = OcrEngineAdapter::service("mock", service_options(connector.clone()));
    adapter.start().await.unwrap();
    assert_eq!(adapter.status(), OcrAdapterStatus::Enabled);
    (adapter, connector)
}

pub fn request(text: &str) -> RecognitionRequest {
    RecognitionRequest::new(text.as_bytes().to_vec(), "ja")
}

pub async fn wait_for_status(adapter: &OcrEngineAdapter, status: OcrAdapterStatus) {
    let mut rx = adapter.subscribe();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == status))
        .await
        .expect("timed out waiting for status")
        .expect("status channel closed");
}
