use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::{ChannelConnector, HttpConnector, RecognitionChannel};
use super::cloud::CloudVisionClient;
use super::manga::{ImageEncoder, MangaOcr, MANGA_LANGUAGES};
use super::request::{RecognitionRequest, RecognitionResult};
use super::settings::{EngineSettings, SettingsUpdate};
use super::status::{OcrAdapterStatus, StatusEvent};
use super::supervisor::{HealthCheck, ProcessExit, ProcessSpec, ProcessSupervisor};
use crate::config::{Config, EngineKind};
use crate::decoding::DecoderInference;
use crate::error::{OcrError, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a local service engine is reached.
#[derive(Clone)]
pub struct ServiceOptions {
    /// Spawn and supervise this process. `None` binds to `address` instead.
    pub process: Option<ProcessSpec>,
    pub address: Option<String>,
    pub connector: Arc<dyn ChannelConnector>,
    pub health: HealthCheck,
    pub settings_retry_limit: u32,
    pub settings: EngineSettings,
}

impl ServiceOptions {
    pub fn from_config(config: &Config) -> Self {
        let process = match &config.service.address {
            Some(_) => None,
            None => Some(ProcessSpec::service(
                &config.service.executable,
                &config.service.presets_dir,
            )),
        };

        Self {
            process,
            address: config.service.address.clone(),
            connector: Arc::new(HttpConnector::new(Duration::from_secs(
                config.service.request_timeout_secs,
            ))),
            health: HealthCheck::new(
                config.supervisor.health_interval(),
                config.supervisor.health_attempts,
            ),
            settings_retry_limit: config.supervisor.settings_retry_limit,
            settings: config.settings.clone(),
        }
    }
}

struct ServiceBackend {
    supervisor: Option<ProcessSupervisor>,
    exits: Mutex<Option<mpsc::UnboundedReceiver<ProcessExit>>>,
    connector: Arc<dyn ChannelConnector>,
    channel: RwLock<Option<Arc<dyn RecognitionChannel>>>,
    address: Mutex<Option<String>>,
}

impl ServiceBackend {
    fn channel(&self) -> Option<Arc<dyn RecognitionChannel>> {
        self.channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_channel(&self, channel: Option<Arc<dyn RecognitionChannel>>) {
        *self.channel.write().unwrap_or_else(PoisonError::into_inner) = channel;
    }
}

enum Backend {
    Service(ServiceBackend),
    Cloud {
        client: CloudVisionClient,
        languages: Vec<String>,
    },
    Manga {
        engine: MangaOcr,
    },
}

struct HeldRequest {
    generation: u64,
    request: RecognitionRequest,
}

enum Admission {
    /// Carries the restart epoch the request was admitted in.
    Admitted(RecognitionRequest, u64),
    Held,
    Rejected(OcrAdapterStatus),
}

struct Inner {
    name: String,
    backend: Backend,
    status: watch::Sender<OcrAdapterStatus>,
    health: HealthCheck,
    settings_retry_limit: u32,
    settings: Mutex<EngineSettings>,
    /// Stamp of the most recent `recognize` call.
    generation: AtomicU64,
    /// Bumped when a restart or shutdown begins. Calls admitted in an older
    /// epoch neither finish the status nor deliver results.
    epoch: AtomicU64,
    /// Restart attempts that ran to the end.
    restarts: AtomicU64,
    /// Coalescing slot. Processing <-> Enabled and epoch bumps only happen
    /// under this lock.
    held: Mutex<Option<HeldRequest>>,
    /// Held for the whole of an engine call.
    calls: tokio::sync::Mutex<()>,
    restart_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl Inner {
    fn current_status(&self) -> OcrAdapterStatus {
        *self.status.borrow()
    }

    fn apply(&self, event: StatusEvent) -> Result<OcrAdapterStatus> {
        let mut outcome = Ok(OcrAdapterStatus::Disabled);
        self.status.send_if_modified(|status| {
            let from = *status;
            match from.transition(event) {
                Ok(to) => {
                    *status = to;
                    outcome = Ok(to);
                    if from != to {
                        debug!(engine = %self.name, %from, %to, "Engine status changed");
                    }
                    from != to
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        outcome
    }

    /// Hold the request if a recognition is in flight. With `begin`, also
    /// claim the engine for this request.
    fn admit(&self, generation: u64, request: RecognitionRequest, begin: bool) -> Admission {
        let mut held = lock(&self.held);
        let status = self.current_status();

        if status == OcrAdapterStatus::Processing {
            if let Some(previous) = held.replace(HeldRequest {
                generation,
                request,
            }) {
                debug!(
                    engine = %self.name,
                    dropped = previous.generation,
                    generation,
                    "Superseding held request"
                );
            } else {
                debug!(engine = %self.name, generation, "Engine busy, holding request");
            }
            return Admission::Held;
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        if !begin {
            return Admission::Admitted(request, epoch);
        }

        match self.apply(StatusEvent::BeginRecognition) {
            Ok(_) => {
                *held = None;
                Admission::Admitted(request, epoch)
            }
            Err(_) => Admission::Rejected(status),
        }
    }

    /// Start a new epoch: drop the held request and move to `event`.
    fn fence(&self, event: StatusEvent) {
        let mut held = lock(&self.held);
        *held = None;
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let _ = self.apply(event);
    }
}

/// One recognition engine behind a uniform status machine.
///
/// At most one recognition runs at a time. Calls that arrive while one is
/// running return `None` right away; the newest of them is run once the
/// current call finishes, and the current caller gets that newer result.
/// Stale results are never returned.
#[derive(Clone)]
pub struct OcrEngineAdapter {
    inner: Arc<Inner>,
}

impl OcrEngineAdapter {
    fn from_backend(
        name: String,
        backend: Backend,
        status: watch::Sender<OcrAdapterStatus>,
        health: HealthCheck,
        settings_retry_limit: u32,
        settings: EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                backend,
                status,
                health,
                settings_retry_limit,
                settings: Mutex::new(settings),
                generation: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                restarts: AtomicU64::new(0),
                held: Mutex::new(None),
                calls: tokio::sync::Mutex::new(()),
                restart_lock: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// A local recognition service, spawned or bound to per `options`.
    pub fn service(name: impl Into<String>, options: ServiceOptions) -> Self {
        let (status, status_rx) = watch::channel(OcrAdapterStatus::Disabled);

        let (supervisor, exits) = match options.process {
            Some(spec) => {
                let (supervisor, exits) = ProcessSupervisor::new(spec, options.health, status_rx);
                (Some(supervisor), Some(exits))
            }
            None => (None, None),
        };

        let backend = Backend::Service(ServiceBackend {
            supervisor,
            exits: Mutex::new(exits),
            connector: options.connector,
            channel: RwLock::new(None),
            address: Mutex::new(options.address),
        });

        Self::from_backend(
            name.into(),
            backend,
            status,
            options.health,
            options.settings_retry_limit,
            options.settings,
        )
    }

    pub fn cloud(name: impl Into<String>, client: CloudVisionClient, languages: Vec<String>) -> Self {
        let (status, _) = watch::channel(OcrAdapterStatus::Disabled);
        Self::from_backend(
            name.into(),
            Backend::Cloud { client, languages },
            status,
            HealthCheck::default(),
            0,
            EngineSettings::default(),
        )
    }

    pub fn manga(name: impl Into<String>, engine: MangaOcr) -> Self {
        let (status, _) = watch::channel(OcrAdapterStatus::Disabled);
        Self::from_backend(
            name.into(),
            Backend::Manga { engine },
            status,
            HealthCheck::default(),
            0,
            EngineSettings::default(),
        )
    }

    /// Manga engine from the configured vocabulary and decoder settings,
    /// running on the given model sessions.
    pub fn manga_from_config(
        config: &Config,
        encoder: Arc<dyn ImageEncoder>,
        inference: Arc<dyn DecoderInference>,
    ) -> Result<Self> {
        let engine = MangaOcr::from_config(encoder, inference, &config.manga, &config.decoder)?;
        Ok(Self::manga("manga", engine))
    }

    /// Build the configured service or cloud engine. The manga engine needs
    /// model sessions and is built with [`OcrEngineAdapter::manga_from_config`].
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.engine.kind {
            EngineKind::Service => Ok(Self::service("local", ServiceOptions::from_config(config))),
            EngineKind::Cloud => {
                let client = CloudVisionClient::new(&config.cloud)?;
                let name = client.provider().name();
                Ok(Self::cloud(name, client, config.cloud.languages.clone()))
            }
            EngineKind::Manga => Err(OcrError::Config(
                "the manga engine needs encoder and decoder sessions".to_string(),
            )),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn status(&self) -> OcrAdapterStatus {
        self.inner.current_status()
    }

    /// Watch status changes.
    pub fn subscribe(&self) -> watch::Receiver<OcrAdapterStatus> {
        self.inner.status.subscribe()
    }

    pub fn settings(&self) -> EngineSettings {
        lock(&self.inner.settings).clone()
    }

    /// Bring the engine up: spawn the service and wait for its address, bind
    /// to a configured address, or just enable a self-managed engine.
    pub async fn start(&self) -> Result<()> {
        info!(engine = %self.inner.name, "Starting OCR engine");

        if let Backend::Service(service) = &self.inner.backend {
            if let Some(supervisor) = &service.supervisor {
                self.spawn_exit_listener(service);
                let address = supervisor.start().await?;
                return self.initialize(Some(&address)).await;
            }
        }
        self.initialize(None).await
    }

    /// Bind to a running service (or the last known address) and enable the
    /// engine. Self-managed engines ignore the address.
    pub async fn initialize(&self, address: Option<&str>) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(OcrError::EngineUnavailable(format!(
                "{} has been shut down",
                self.inner.name
            )));
        }

        if let Backend::Service(service) = &self.inner.backend {
            let address = match address {
                Some(address) => address.to_string(),
                None => lock(&service.address)
                    .clone()
                    .ok_or_else(|| OcrError::Config("no OCR service address".to_string()))?,
            };

            let channel = service.connector.connect(&address).await?;
            service.set_channel(Some(channel));
            info!(engine = %self.inner.name, %address, "Bound to OCR service");
            *lock(&service.address) = Some(address);
        }

        self.inner.apply(StatusEvent::Initialize)?;
        Ok(())
    }

    /// Recognize text in an image.
    ///
    /// Returns `None` when the engine is busy (the request is held and may be
    /// answered to the in-flight caller instead), unavailable, failed, or
    /// found no text.
    pub async fn recognize(&self, request: RecognitionRequest) -> Option<RecognitionResult> {
        let inner = &self.inner;
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let request = match inner.admit(generation, request, false) {
            Admission::Admitted(request, _) => request,
            Admission::Held | Admission::Rejected(_) => return None,
        };

        if matches!(inner.backend, Backend::Service(_))
            && !inner.health.wait_until_enabled(&inner.status.subscribe()).await
        {
            warn!(engine = %inner.name, generation, "OCR engine unavailable, dropping request");
            return None;
        }

        let (request, epoch) = match inner.admit(generation, request, true) {
            Admission::Admitted(request, epoch) => (request, epoch),
            Admission::Held => return None,
            Admission::Rejected(status) => {
                debug!(engine = %inner.name, %status, "Engine not accepting requests");
                return None;
            }
        };

        let _call = inner.calls.lock().await;
        let mut current = HeldRequest {
            generation,
            request,
        };

        loop {
            if inner.epoch.load(Ordering::SeqCst) != epoch {
                debug!(engine = %inner.name, generation, "Engine restarted before the call");
                return None;
            }

            let outcome = self.call_engine(&current.request).await;
            let mut held = lock(&inner.held);

            if inner.epoch.load(Ordering::SeqCst) != epoch {
                debug!(
                    engine = %inner.name,
                    generation = current.generation,
                    "Dropping result of a call that outlived a restart"
                );
                return None;
            }

            match outcome {
                Err(e) if e.is_engine_failure() => {
                    let observed = inner.restarts.load(Ordering::SeqCst);
                    *held = None;
                    let _ = inner.apply(StatusEvent::BeginRestart);
                    drop(held);
                    error!(engine = %inner.name, error = %e, "Recognition failed, restarting engine");
                    let adapter = self.clone();
                    tokio::spawn(async move { adapter.restart_unless_done(Some(observed)).await });
                    return None;
                }
                outcome => {
                    if let Some(next) = held.take() {
                        debug!(
                            engine = %inner.name,
                            discarded = current.generation,
                            next = next.generation,
                            "Discarding superseded result"
                        );
                        current = next;
                        continue;
                    }

                    if inner.current_status() == OcrAdapterStatus::Processing {
                        let _ = inner.apply(StatusEvent::FinishRecognition);
                    }
                    drop(held);

                    let result = match outcome {
                        Ok(result) => result,
                        Err(e) => {
                            warn!(engine = %inner.name, error = %e, "Recognition produced no result");
                            return None;
                        }
                    };

                    let latest = inner.generation.load(Ordering::SeqCst);
                    if current.generation != latest {
                        debug!(
                            engine = %inner.name,
                            generation = current.generation,
                            latest,
                            "Result superseded by a newer request"
                        );
                        return None;
                    }
                    if result.is_empty() {
                        debug!(engine = %inner.name, "No text recognized");
                        return None;
                    }
                    return Some(result.for_request(&current.request));
                }
            }
        }
    }

    async fn call_engine(&self, request: &RecognitionRequest) -> Result<RecognitionResult> {
        match &self.inner.backend {
            Backend::Service(service) => {
                let channel = service
                    .channel()
                    .ok_or_else(|| OcrError::EngineUnavailable("channel not bound".to_string()))?;
                let id = uuid::Uuid::new_v4().to_string();
                channel
                    .recognize_bytes(&id, &request.image_bytes, &request.language_code)
                    .await
            }
            Backend::Cloud { client, .. } => client
                .recognize(&request.image_bytes, &request.language_code)
                .await
                .map(RecognitionResult::from_text),
            Backend::Manga { engine } => engine
                .recognize(&request.image_bytes)
                .await
                .map(RecognitionResult::from_text),
        }
    }

    pub async fn get_supported_languages(&self) -> Vec<String> {
        match &self.inner.backend {
            Backend::Service(service) => {
                let Some(channel) = service.channel() else {
                    debug!(engine = %self.inner.name, "Channel not bound, no languages");
                    return Vec::new();
                };
                channel.supported_languages().await.unwrap_or_else(|e| {
                    warn!(engine = %self.inner.name, error = %e, "Failed to query languages");
                    Vec::new()
                })
            }
            Backend::Cloud { languages, .. } => languages.clone(),
            Backend::Manga { .. } => MANGA_LANGUAGES.iter().map(|l| l.to_string()).collect(),
        }
    }

    /// Validate and apply new settings. `restart` tells the caller the engine
    /// has to be restarted to pick them up; service engines also receive the
    /// new settings right away.
    pub async fn update_settings(
        &self,
        new: EngineSettings,
        old: Option<&EngineSettings>,
    ) -> SettingsUpdate {
        let previous = old.cloned().unwrap_or_else(|| self.settings());
        let settings = new.validated(Some(&previous));
        let restart = previous.requires_restart(&settings);

        *lock(&self.inner.settings) = settings.clone();

        if restart {
            info!(
                engine = %self.inner.name,
                threads = settings.threads,
                max_image_width = settings.max_image_width,
                runtime = %settings.inference_runtime,
                "Engine settings changed"
            );
            if let Backend::Service(service) = &self.inner.backend {
                self.push_settings(service, &settings).await;
            }
        }

        SettingsUpdate { settings, restart }
    }

    async fn push_settings(&self, service: &ServiceBackend, settings: &EngineSettings) {
        let limit = self.inner.settings_retry_limit;
        let mut retries = 0;

        loop {
            let pushed = match service.channel() {
                Some(channel) => channel.update_settings(settings).await,
                None => Err(OcrError::EngineUnavailable("channel not bound".to_string())),
            };

            match pushed {
                Ok(()) => {
                    debug!(engine = %self.inner.name, "Settings pushed to OCR service");
                    return;
                }
                Err(e) if retries < limit => {
                    retries += 1;
                    warn!(
                        engine = %self.inner.name,
                        error = %e,
                        retries,
                        limit,
                        "Failed to push settings, restarting engine"
                    );
                    self.restart().await;
                }
                Err(e) => {
                    warn!(
                        engine = %self.inner.name,
                        error = %e,
                        "Giving up pushing settings"
                    );
                    return;
                }
            }
        }
    }

    /// Restart the engine and wait until it is usable again. Returns false
    /// when it is not; the status then stays `Restarting`.
    ///
    /// A recognition still running against the old engine is waited for
    /// before the engine is enabled again, and its result is dropped.
    pub async fn restart(&self) -> bool {
        self.restart_unless_done(None).await
    }

    /// Start a restart without waiting for it.
    pub fn restart_in_background(&self) -> JoinHandle<bool> {
        let adapter = self.clone();
        tokio::spawn(async move { adapter.restart().await })
    }

    /// With `observed`, skip the restart when one has already completed since
    /// the failure was seen (`observed` is the restart count at that time).
    async fn restart_unless_done(&self, observed: Option<u64>) -> bool {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return false;
        }

        let _guard = inner.restart_lock.lock().await;
        if inner.shutdown.is_cancelled() {
            return false;
        }
        if let Some(observed) = observed {
            if inner.restarts.load(Ordering::SeqCst) != observed {
                debug!(engine = %inner.name, "Engine already restarted for this failure");
                return self.status() == OcrAdapterStatus::Enabled;
            }
        }

        inner.fence(StatusEvent::BeginRestart);
        info!(engine = %inner.name, "Restarting OCR engine");

        let restarted = match &inner.backend {
            Backend::Service(service) => self.restart_service(service).await,
            Backend::Cloud { .. } | Backend::Manga { .. } => {
                let _idle = inner.calls.lock().await;
                self.initialize(None).await.is_ok()
            }
        };
        inner.restarts.fetch_add(1, Ordering::SeqCst);

        if restarted {
            info!(engine = %inner.name, "OCR engine restarted");
        } else {
            warn!(engine = %inner.name, status = %self.status(), "OCR engine restart failed");
        }
        restarted
    }

    async fn restart_service(&self, service: &ServiceBackend) -> bool {
        let address = match &service.supervisor {
            Some(supervisor) => match supervisor.restart().await {
                Ok(address) => Some(address),
                Err(e) => {
                    error!(engine = %self.inner.name, error = %e, "Failed to restart OCR service");
                    return false;
                }
            },
            None => None,
        };

        if self.inner.shutdown.is_cancelled() {
            if let Some(supervisor) = &service.supervisor {
                supervisor.stop().await;
            }
            return false;
        }

        {
            let _idle = self.inner.calls.lock().await;
            if let Err(e) = self.initialize(address.as_deref()).await {
                warn!(engine = %self.inner.name, error = %e, "Failed to rebind OCR service");
                return false;
            }
        }

        self.inner
            .health
            .wait_until_enabled(&self.inner.status.subscribe())
            .await
    }

    fn spawn_exit_listener(&self, service: &ServiceBackend) {
        let Some(mut exits) = lock(&service.exits).take() else {
            return;
        };
        let adapter = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let exit = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    exit = exits.recv() => exit,
                };
                let Some(exit) = exit else { break };
                let Some(inner) = adapter.upgrade() else { break };

                let observed = inner.restarts.load(Ordering::SeqCst);
                let adapter = OcrEngineAdapter { inner };
                if adapter.service_pid() != exit.pid {
                    debug!(engine = %adapter.name(), pid = ?exit.pid, "Exited process already replaced");
                    continue;
                }
                warn!(
                    engine = %adapter.name(),
                    pid = ?exit.pid,
                    code = ?exit.code,
                    "Restarting OCR service after unexpected exit"
                );
                adapter.restart_unless_done(Some(observed)).await;
            }
        });
    }

    fn service_pid(&self) -> Option<u32> {
        match &self.inner.backend {
            Backend::Service(service) => service.supervisor.as_ref().and_then(|s| s.pid()),
            _ => None,
        }
    }

    /// Stop the engine for good: kill the service process, unbind the
    /// channel and disable the adapter. Waits for a running restart to wind
    /// down first.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        let _guard = inner.restart_lock.lock().await;

        if let Backend::Service(service) = &inner.backend {
            if let Some(supervisor) = &service.supervisor {
                supervisor.stop().await;
            }
            service.set_channel(None);
        }

        inner.fence(StatusEvent::Disable);
        info!(engine = %inner.name, "OCR engine shut down");
    }
}
