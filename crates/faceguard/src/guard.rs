//! The live recognition component: model loading, camera lifecycle, the
//! throttled detection loop and enrollment.

use crate::config::{is_usable_threshold, GuardConfig};
use crate::engine::{DetectOptions, EngineError, EngineHandle};
use crate::events::{GuardEvent, StatusKind, StatusLine, EVENT_CAPACITY};
use crate::store::{IdentityStore, StoreError};
use faceguard_core::geometry::{MAX_INPUT_SIZE, NO_USERS_COLOR, RECOGNIZED_COLOR, UNKNOWN_COLOR};
use faceguard_core::{
    adjusted_threshold, draw_attributes, draw_box, optimal_input_size, resize_canvas, BoxStyle, Canvas,
    DescriptorError, Detection, FaceMatcher, Identity, MatchLabel, StorageData, Throttle,
};
use faceguard_hw::{CameraError, CameraProvider, CameraRequest, VideoSource};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Drawing surface shared between the component and its loop.
pub type SharedCanvas = Arc<Mutex<dyn Canvas>>;

type SharedMatcher = Arc<RwLock<Option<Arc<FaceMatcher>>>>;

const NO_USERS_CAPTION: &str = "No users enrolled";

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Name is required for enrollment")]
    EmptyName,
    #[error("Camera must be started before enrollment")]
    CameraNotLive,
    #[error("No face detected. Please ensure your face is clearly visible.")]
    NoFaceDetected,
    #[error("Invalid face descriptor generated")]
    InvalidDescriptor(#[source] DescriptorError),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("engine error: {0}")]
    Engine(EngineError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl From<EngineError> for GuardError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Descriptor(d) => Self::InvalidDescriptor(d),
            other => Self::Engine(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardState {
    Uninitialized,
    ModelsLoading,
    Idle,
    CameraStarting,
    Live,
    Stopped,
    Error { message: String, recoverable: bool },
}

impl GuardState {
    /// True in the states `start` accepts.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Stopped | Self::Error { recoverable: true, .. }
        )
    }

    pub fn models_loaded(&self) -> bool {
        matches!(
            self,
            Self::Idle
                | Self::CameraStarting
                | Self::Live
                | Self::Stopped
                | Self::Error { recoverable: true, .. }
        )
    }
}

/// Values the loop re-reads on every iteration.
struct LoopSettings {
    fps: AtomicU32,
    max_faces: AtomicUsize,
}

struct LiveSession {
    source: Arc<dyn VideoSource>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Live face recognition over one camera and one identity store.
pub struct FaceGuard {
    engine: EngineHandle,
    camera: Arc<dyn CameraProvider>,
    store: IdentityStore,
    canvas: SharedCanvas,
    events: broadcast::Sender<GuardEvent>,
    state: GuardState,
    status: StatusLine,
    threshold: f32,
    score_threshold: f32,
    model_dir: PathBuf,
    camera_device: Option<String>,
    settings: Arc<LoopSettings>,
    gallery: Vec<Identity>,
    matcher: SharedMatcher,
    input_size: u32,
    live: Option<LiveSession>,
}

impl FaceGuard {
    pub fn new(
        config: &GuardConfig,
        engine: EngineHandle,
        camera: Arc<dyn CameraProvider>,
        store: IdentityStore,
        canvas: SharedCanvas,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            engine,
            camera,
            store,
            canvas,
            events,
            state: GuardState::Uninitialized,
            status: StatusLine::default(),
            threshold: config.threshold,
            score_threshold: config.score_threshold,
            model_dir: config.model_dir.clone(),
            camera_device: config.camera_device.clone(),
            settings: Arc::new(LoopSettings {
                fps: AtomicU32::new(config.fps),
                max_faces: AtomicUsize::new(config.max_faces),
            }),
            gallery: Vec::new(),
            matcher: Arc::new(RwLock::new(None)),
            input_size: MAX_INPUT_SIZE,
            live: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GuardEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> &GuardState {
        &self.state
    }

    pub fn status(&self) -> &StatusLine {
        &self.status
    }

    /// In-memory copy of the enrolled gallery.
    pub fn identities(&self) -> &[Identity] {
        &self.gallery
    }

    pub fn store(&self) -> &IdentityStore {
        &self.store
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Effective threshold of the current matcher, `None` when nobody is
    /// enrolled.
    pub fn matcher_threshold(&self) -> Option<f32> {
        read(&self.matcher).as_ref().map(|m| m.threshold())
    }

    pub fn fps(&self) -> u32 {
        self.settings.fps.load(Ordering::Relaxed)
    }

    pub fn max_faces(&self) -> usize {
        self.settings.max_faces.load(Ordering::Relaxed)
    }

    /// Load the gallery and the model weights. Model failure is fatal.
    pub async fn attach(&mut self) -> Result<(), GuardError> {
        if self.state != GuardState::Uninitialized {
            tracing::debug!(state = ?self.state, "attach ignored");
            return Ok(());
        }
        self.state = GuardState::ModelsLoading;
        self.set_status("Loading AI models...", StatusKind::Loading);

        if let Err(e) = self.engine.load_models(self.model_dir.clone()).await {
            let message = "Error loading AI models. Please refresh.";
            self.state = GuardState::Error {
                message: message.to_string(),
                recoverable: false,
            };
            self.fail(message, "Failed to load AI models", &e);
            return Err(e.into());
        }

        match self.store.list_identities().await {
            Ok(users) => self.gallery = users,
            Err(e) => tracing::warn!(error = %e, "failed to load enrolled users; starting empty"),
        }
        self.rebuild_matcher();

        self.state = GuardState::Idle;
        self.set_status("Models loaded. Ready to start!", StatusKind::Ready);
        tracing::info!(users = self.gallery.len(), "face guard attached");
        Ok(())
    }

    /// Acquire the camera and start the detection loop.
    ///
    /// A no-op unless the component is idle, stopped, or in a recoverable
    /// error.
    pub async fn start(&mut self) -> Result<(), GuardError> {
        if !self.state.can_start() {
            tracing::debug!(state = ?self.state, "start ignored");
            return Ok(());
        }
        self.state = GuardState::CameraStarting;
        self.set_status("Starting camera...", StatusKind::Loading);

        let request = CameraRequest {
            device: self.camera_device.clone(),
            ..CameraRequest::default()
        };
        let provider = Arc::clone(&self.camera);
        let acquired = tokio::task::spawn_blocking(move || provider.acquire(&request))
            .await
            .unwrap_or_else(|e| Err(CameraError::CaptureFailed(format!("camera task failed: {e}"))));

        let source = match acquired {
            Ok(source) => source,
            Err(e) => {
                let message = "Error accessing camera. Please allow camera access.";
                self.state = GuardState::Error {
                    message: message.to_string(),
                    recoverable: true,
                };
                self.fail(message, "Failed to access camera", &e);
                return Err(e.into());
            }
        };

        let (width, height) = source.dimensions();
        resize_canvas(&mut *lock(&self.canvas), width, height);
        self.input_size = optimal_input_size(width, height);
        self.rebuild_matcher();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let ctx = LoopContext {
            engine: self.engine.clone(),
            source: Arc::clone(&source),
            canvas: Arc::clone(&self.canvas),
            matcher: Arc::clone(&self.matcher),
            settings: Arc::clone(&self.settings),
            events: self.events.clone(),
            options: self.detect_options(),
        };
        let task = tokio::spawn(run_loop(ctx, shutdown_rx));
        self.live = Some(LiveSession {
            source,
            shutdown,
            task,
        });

        self.state = GuardState::Live;
        self.set_status(format!("Camera started ({width}x{height})"), StatusKind::Ready);
        tracing::info!(width, height, input_size = self.input_size, "camera started");
        Ok(())
    }

    /// Stop the loop and release the camera. Safe to call repeatedly.
    pub fn stop(&mut self) {
        let Some(session) = self.live.take() else {
            return;
        };
        let _ = session.shutdown.send(true);
        session.task.abort();
        session.source.stop_tracks();
        lock(&self.canvas).clear();

        self.state = GuardState::Stopped;
        self.set_status("Camera stopped", StatusKind::Ready);
        tracing::info!("camera stopped");
    }

    /// Capture one descriptor for `name` and append it to the gallery.
    /// Returns the identity's sample count.
    pub async fn enroll(&mut self, name: &str) -> Result<usize, GuardError> {
        let label = name.trim().to_string();
        match self.enroll_current_face(&label).await {
            Ok(count) => {
                self.set_status(format!("Enrolled {label} ({count} samples)"), StatusKind::Ready);
                let _ = self.events.send(GuardEvent::Enrolled { label, count });
                Ok(count)
            }
            Err(e) => {
                self.fail(&format!("Enrollment failed. {e}"), "Enrollment failed", &e);
                Err(e)
            }
        }
    }

    async fn enroll_current_face(&mut self, label: &str) -> Result<usize, GuardError> {
        if label.is_empty() {
            return Err(GuardError::EmptyName);
        }
        let source = match (&self.state, &self.live) {
            (GuardState::Live, Some(session)) => Arc::clone(&session.source),
            _ => return Err(GuardError::CameraNotLive),
        };

        self.set_status("Detecting face for enrollment...", StatusKind::Loading);
        let frame = source.current_frame()?;
        let detection = self
            .engine
            .detect_single(frame, self.detect_options())
            .await?
            .ok_or(GuardError::NoFaceDetected)?;

        let created_at = chrono::Utc::now().timestamp_millis();
        let identity = self
            .store
            .enroll_sample(label, created_at, detection.descriptor)
            .await?;
        let count = identity.sample_count();

        match self.gallery.iter_mut().find(|u| u.label == identity.label) {
            Some(existing) => *existing = identity,
            None => self.gallery.push(identity),
        }
        self.rebuild_matcher();
        Ok(count)
    }

    /// Remove one identity. Unknown labels are a no-op returning false.
    pub async fn delete_identity(&mut self, label: &str) -> Result<bool, GuardError> {
        match self.store.delete_identity(label).await {
            Ok(removed) => {
                self.gallery.retain(|u| u.label != label);
                self.rebuild_matcher();
                self.set_status(format!("Deleted user {label}"), StatusKind::Ready);
                Ok(removed)
            }
            Err(e) => {
                self.fail(&format!("Failed to delete user {label}"), "Delete failed", &e);
                Err(e.into())
            }
        }
    }

    pub async fn clear_identities(&mut self) -> Result<(), GuardError> {
        match self.store.clear_all().await {
            Ok(()) => {
                self.gallery.clear();
                self.rebuild_matcher();
                self.set_status("All users cleared", StatusKind::Ready);
                Ok(())
            }
            Err(e) => {
                self.fail("Failed to clear users", "Clear failed", &e);
                Err(e.into())
            }
        }
    }

    pub async fn export_snapshot(&mut self) -> Result<StorageData, GuardError> {
        match self.store.export_snapshot().await {
            Ok(data) => Ok(data),
            Err(e) => {
                self.fail("Export failed", "Export failed", &e);
                Err(e.into())
            }
        }
    }

    /// Replace the gallery with `data`. Returns the number of users imported.
    pub async fn import_snapshot(&mut self, data: &StorageData) -> Result<usize, GuardError> {
        self.set_status("Importing users...", StatusKind::Loading);
        let result = match self.store.import_snapshot(data).await {
            Ok(_) => self.store.list_identities().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(users) => {
                self.gallery = users;
                self.rebuild_matcher();
                let imported = data.users.len();
                self.set_status(format!("Imported {imported} users"), StatusKind::Ready);
                Ok(imported)
            }
            Err(e) => {
                self.import_failed(&e);
                Err(e.into())
            }
        }
    }

    /// Report an import that failed before reaching the store.
    pub fn import_failed(&mut self, cause: &dyn std::fmt::Display) {
        self.fail("Import failed. Please check file format.", "Import failed", cause);
    }

    /// Change the base match threshold and rebuild the matcher.
    ///
    /// Non-finite or non-positive values are ignored.
    pub fn set_threshold(&mut self, threshold: f32) {
        if !is_usable_threshold(threshold) {
            tracing::warn!(threshold, "ignoring unusable match threshold");
            return;
        }
        self.threshold = threshold;
        self.rebuild_matcher();
    }

    /// Takes effect on the next loop iteration.
    pub fn set_fps(&mut self, fps: u32) {
        self.settings.fps.store(fps, Ordering::Relaxed);
    }

    /// Applies to future passes only.
    pub fn set_max_faces(&mut self, max_faces: usize) {
        self.settings.max_faces.store(max_faces, Ordering::Relaxed);
    }

    /// Release the camera; the component is going away.
    pub fn detach(&mut self) {
        self.stop();
        tracing::info!("face guard detached");
    }

    /// Record an externally produced status message, e.g. from the host.
    pub fn report_status(&mut self, message: impl Into<String>, kind: StatusKind) {
        self.set_status(message, kind);
    }

    fn detect_options(&self) -> DetectOptions {
        DetectOptions {
            input_size: self.input_size,
            score_threshold: self.score_threshold,
        }
    }

    fn rebuild_matcher(&mut self) {
        let threshold = adjusted_threshold(self.threshold, self.input_size);
        let matcher = FaceMatcher::rebuild(&self.gallery, threshold).map(Arc::new);
        *write(&self.matcher) = matcher;
    }

    fn set_status(&mut self, message: impl Into<String>, kind: StatusKind) {
        self.status = StatusLine::new(message, kind);
        let _ = self.events.send(GuardEvent::Status {
            message: self.status.message.clone(),
            is_loading: self.status.is_loading(),
        });
    }

    fn fail(&mut self, status: &str, message: &str, cause: &dyn std::fmt::Display) {
        tracing::warn!(error = %cause, "{message}");
        self.set_status(status, StatusKind::Error);
        let _ = self.events.send(GuardEvent::Error {
            message: message.to_string(),
            cause: cause.to_string(),
        });
    }
}

impl Drop for FaceGuard {
    fn drop(&mut self) {
        if let Some(session) = self.live.take() {
            session.task.abort();
            session.source.stop_tracks();
        }
    }
}

/// Everything a loop task needs, detached from the component.
struct LoopContext {
    engine: EngineHandle,
    source: Arc<dyn VideoSource>,
    canvas: SharedCanvas,
    matcher: SharedMatcher,
    settings: Arc<LoopSettings>,
    events: broadcast::Sender<GuardEvent>,
    options: DetectOptions,
}

/// Throttled detection loop with at most one pass in flight.
async fn run_loop(ctx: LoopContext, mut shutdown: watch::Receiver<bool>) {
    let mut fps = ctx.settings.fps.load(Ordering::Relaxed);
    let mut throttle = Throttle::new(fps);
    tracing::debug!(fps, input_size = ctx.options.input_size, "detection loop started");

    loop {
        let wanted = ctx.settings.fps.load(Ordering::Relaxed);
        if wanted != fps {
            fps = wanted;
            throttle = Throttle::new(fps);
            tracing::debug!(fps, "throttle re-derived");
        }

        let delay = throttle.delay_until_ready(Instant::now());
        if !delay.is_zero() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if *shutdown.borrow() {
            break;
        }
        if !throttle.ready(Instant::now()) || !ctx.source.is_ready() {
            continue;
        }

        if let Err(e) = run_pass(&ctx).await {
            tracing::warn!(error = %e, "detection pass failed");
        }
    }
    tracing::debug!("detection loop stopped");
}

async fn run_pass(ctx: &LoopContext) -> Result<(), GuardError> {
    let frame = ctx.source.current_frame()?;
    let detections = ctx.engine.detect_all(frame, ctx.options).await?;
    let max_faces = ctx.settings.max_faces.load(Ordering::Relaxed);
    let matcher = read(&ctx.matcher).clone();

    let events = render(&ctx.canvas, &detections, max_faces, matcher.as_deref());
    for event in events {
        let _ = ctx.events.send(event);
    }
    Ok(())
}

/// Redraw the overlay for one pass and collect the recognition events.
fn render(
    canvas: &Mutex<dyn Canvas>,
    detections: &[Detection],
    max_faces: usize,
    matcher: Option<&FaceMatcher>,
) -> Vec<GuardEvent> {
    let mut canvas = lock(canvas);
    canvas.clear();

    let mut events = Vec::new();
    for detection in detections.iter().take(max_faces) {
        let bbox = detection.bbox;
        let Some(matcher) = matcher else {
            draw_box(&mut *canvas, &bbox, &BoxStyle::new(NO_USERS_COLOR).label(NO_USERS_CAPTION));
            if let Some(attributes) = &detection.attributes {
                draw_attributes(&mut *canvas, &bbox, detection.score, attributes);
            }
            continue;
        };

        let result = matcher.classify(&detection.descriptor);
        match result.label {
            MatchLabel::Known(label) => {
                let style = BoxStyle::new(RECOGNIZED_COLOR)
                    .label(label.clone())
                    .distance(result.distance);
                draw_box(&mut *canvas, &bbox, &style);
                events.push(GuardEvent::Recognized {
                    label,
                    distance: result.distance,
                    bbox,
                });
            }
            MatchLabel::Unknown => {
                let style = BoxStyle::new(UNKNOWN_COLOR).distance(result.distance);
                draw_box(&mut *canvas, &bbox, &style);
                events.push(GuardEvent::Unknown {
                    distance: result.distance,
                    bbox,
                });
            }
        }
        if let Some(attributes) = &detection.attributes {
            draw_attributes(&mut *canvas, &bbox, detection.score, attributes);
        }
    }
    events
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::{spawn_engine, FaceEngine};
    use crate::store::StoreConfig;
    use faceguard_core::{Descriptor, FaceAttributes, FaceBox, ImageCanvas, DESCRIPTOR_DIM};
    use faceguard_hw::Frame;
    use std::path::Path;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    pub(crate) fn descriptor(value: f32) -> Descriptor {
        Descriptor::try_from(vec![value; DESCRIPTOR_DIM]).unwrap()
    }

    fn detection(x: f32, value: f32) -> Detection {
        Detection {
            bbox: FaceBox {
                x,
                y: 100.0,
                width: 50.0,
                height: 50.0,
            },
            score: 0.9,
            landmarks: vec![(0.0, 0.0); 68],
            descriptor: descriptor(value),
            attributes: None,
        }
    }

    /// Call bookkeeping shared between a [`FakeEngine`] and its test.
    #[derive(Default)]
    pub(crate) struct EngineStats {
        /// `detect_all` calls that fail before detections come back.
        pub failures_left: AtomicUsize,
        pub calls: AtomicUsize,
        in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl EngineStats {
        fn enter(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        }

        fn leave(&self) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        fn take_failure(&self) -> bool {
            self.failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    /// Engine returning whatever the test puts in `faces`.
    pub(crate) struct FakeEngine {
        pub faces: Arc<Mutex<Vec<Detection>>>,
        pub fail_load: bool,
        pub stats: Arc<EngineStats>,
    }

    impl FaceEngine for FakeEngine {
        fn load_models(&mut self, model_dir: &Path) -> Result<(), EngineError> {
            if self.fail_load {
                return Err(EngineError::ModelLoad {
                    path: model_dir.to_path_buf(),
                    reason: "weights missing".into(),
                });
            }
            Ok(())
        }

        fn detect_all(&mut self, _frame: &Frame, _options: DetectOptions) -> Result<Vec<Detection>, EngineError> {
            self.stats.enter();
            std::thread::sleep(Duration::from_millis(1));
            let result = if self.stats.take_failure() {
                Err(EngineError::Inference("backend hiccup".into()))
            } else {
                Ok(lock(&self.faces).clone())
            };
            self.stats.leave();
            result
        }

        fn detect_single(
            &mut self,
            _frame: &Frame,
            _options: DetectOptions,
        ) -> Result<Option<Detection>, EngineError> {
            self.stats.enter();
            let face = lock(&self.faces).first().cloned();
            self.stats.leave();
            Ok(face)
        }
    }

    pub(crate) struct FakeSource {
        pub width: u32,
        pub height: u32,
        pub stops: AtomicUsize,
        stopped: AtomicBool,
    }

    impl VideoSource for FakeSource {
        fn dimensions(&self) -> (u32, u32) {
            (self.width, self.height)
        }

        fn is_ready(&self) -> bool {
            !self.stopped.load(Ordering::SeqCst)
        }

        fn current_frame(&self) -> Result<Frame, CameraError> {
            Ok(Frame::from_rgb(vec![0; 12], 2, 2, 0).expect("valid frame"))
        }

        fn stop_tracks(&self) {
            self.stopped.store(true, Ordering::SeqCst);
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) struct FakeProvider {
        pub deny: AtomicBool,
        pub acquired: Mutex<Vec<Arc<FakeSource>>>,
    }

    impl FakeProvider {
        pub fn new() -> Self {
            Self {
                deny: AtomicBool::new(false),
                acquired: Mutex::new(Vec::new()),
            }
        }

        pub fn last_source(&self) -> Arc<FakeSource> {
            Arc::clone(lock(&self.acquired).last().expect("a source was acquired"))
        }
    }

    impl CameraProvider for FakeProvider {
        fn acquire(&self, request: &CameraRequest) -> Result<Arc<dyn VideoSource>, CameraError> {
            if self.deny.load(Ordering::SeqCst) {
                return Err(CameraError::PermissionDenied("denied by user".into()));
            }
            let source = Arc::new(FakeSource {
                width: request.ideal_width,
                height: request.ideal_height,
                stops: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
            });
            lock(&self.acquired).push(Arc::clone(&source));
            Ok(source)
        }
    }

    pub(crate) struct Harness {
        pub guard: FaceGuard,
        pub faces: Arc<Mutex<Vec<Detection>>>,
        pub stats: Arc<EngineStats>,
        pub provider: Arc<FakeProvider>,
        pub canvas: Arc<Mutex<ImageCanvas>>,
        pub events: broadcast::Receiver<GuardEvent>,
    }

    pub(crate) async fn harness_with(fail_load: bool) -> Harness {
        let faces = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(EngineStats::default());
        let engine = spawn_engine(FakeEngine {
            faces: Arc::clone(&faces),
            fail_load,
            stats: Arc::clone(&stats),
        })
        .unwrap();
        let provider = Arc::new(FakeProvider::new());
        let canvas = Arc::new(Mutex::new(ImageCanvas::new(1, 1)));
        let store = IdentityStore::initialize(&StoreConfig::in_memory()).await.unwrap();
        let config = GuardConfig {
            fps: 50,
            ..GuardConfig::default()
        };
        let shared: SharedCanvas = canvas.clone();
        let guard = FaceGuard::new(&config, engine, provider.clone(), store, shared);
        let events = guard.subscribe();
        Harness {
            guard,
            faces,
            stats,
            provider,
            canvas,
            events,
        }
    }

    pub(crate) async fn harness() -> Harness {
        harness_with(false).await
    }

    pub(crate) async fn live_harness() -> Harness {
        let mut h = harness().await;
        h.guard.attach().await.unwrap();
        h.guard.start().await.unwrap();
        h
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<GuardEvent>, pred: F) -> GuardEvent
    where
        F: Fn(&GuardEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn wait_for_captions(canvas: &Mutex<ImageCanvas>, count: usize) -> Vec<String> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let captions: Vec<String> = lock(canvas)
                    .annotations()
                    .iter()
                    .map(|a| a.text.clone())
                    .collect();
                if captions.len() == count {
                    return captions;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for overlay")
    }

    #[tokio::test]
    async fn test_attach_loads_models() {
        let mut h = harness().await;
        h.guard.attach().await.unwrap();
        assert_eq!(*h.guard.state(), GuardState::Idle);
        assert_eq!(h.guard.status().message, "Models loaded. Ready to start!");
        assert_eq!(h.guard.status().kind, StatusKind::Ready);
    }

    #[tokio::test]
    async fn test_model_failure_is_fatal() {
        let mut h = harness_with(true).await;
        assert!(h.guard.attach().await.is_err());
        assert_eq!(
            *h.guard.state(),
            GuardState::Error {
                message: "Error loading AI models. Please refresh.".into(),
                recoverable: false
            }
        );
        let event = next_matching(&mut h.events, |e| matches!(e, GuardEvent::Error { .. })).await;
        assert!(matches!(event, GuardEvent::Error { message, .. } if message == "Failed to load AI models"));

        h.guard.start().await.unwrap();
        assert!(lock(&h.provider.acquired).is_empty());
        assert!(!h.guard.state().models_loaded());
    }

    #[tokio::test]
    async fn test_start_sizes_canvas_and_input() {
        let h = live_harness().await;
        assert_eq!(*h.guard.state(), GuardState::Live);
        assert_eq!(h.guard.status().message, "Camera started (1280x720)");
        assert_eq!(h.guard.input_size(), 416);
        let canvas = lock(&h.canvas);
        assert_eq!((canvas.width(), canvas.height()), (1280, 720));
    }

    #[tokio::test]
    async fn test_camera_failure_is_recoverable() {
        let mut h = harness().await;
        h.guard.attach().await.unwrap();
        h.provider.deny.store(true, Ordering::SeqCst);

        assert!(matches!(h.guard.start().await, Err(GuardError::Camera(_))));
        assert!(matches!(h.guard.state(), GuardState::Error { recoverable: true, .. }));
        assert_eq!(
            h.guard.status().message,
            "Error accessing camera. Please allow camera access."
        );
        let event = next_matching(&mut h.events, |e| matches!(e, GuardEvent::Error { .. })).await;
        assert!(matches!(event, GuardEvent::Error { message, .. } if message == "Failed to access camera"));

        h.provider.deny.store(false, Ordering::SeqCst);
        h.guard.start().await.unwrap();
        assert_eq!(*h.guard.state(), GuardState::Live);
    }

    #[tokio::test]
    async fn test_start_ignored_when_live() {
        let mut h = live_harness().await;
        h.guard.start().await.unwrap();
        assert_eq!(lock(&h.provider.acquired).len(), 1);
    }

    #[tokio::test]
    async fn test_stop_twice_releases_once() {
        let mut h = live_harness().await;
        let source = h.provider.last_source();

        h.guard.stop();
        h.guard.stop();
        assert_eq!(source.stops.load(Ordering::SeqCst), 1);
        assert_eq!(*h.guard.state(), GuardState::Stopped);
        assert_eq!(h.guard.status().message, "Camera stopped");
        assert!(lock(&h.canvas).is_blank());

        // restart after stop acquires a fresh stream
        h.guard.start().await.unwrap();
        assert_eq!(lock(&h.provider.acquired).len(), 2);
    }

    #[tokio::test]
    async fn test_enroll_without_face_stores_nothing() {
        let mut h = live_harness().await;
        let err = h.guard.enroll("Alice").await;
        assert!(matches!(err, Err(GuardError::NoFaceDetected)));
        assert!(h.guard.store().list_identities().await.unwrap().is_empty());
        assert_eq!(*h.guard.state(), GuardState::Live);
        assert!(h.guard.status().message.starts_with("Enrollment failed. No face detected."));
        let event = next_matching(&mut h.events, |e| matches!(e, GuardEvent::Error { .. })).await;
        assert!(matches!(event, GuardEvent::Error { message, .. } if message == "Enrollment failed"));
    }

    #[tokio::test]
    async fn test_enroll_twice_appends() {
        let mut h = live_harness().await;
        *lock(&h.faces) = vec![detection(10.0, 0.1)];

        assert_eq!(h.guard.enroll("  Alice ").await.unwrap(), 1);
        assert_eq!(h.guard.enroll("Alice").await.unwrap(), 2);
        assert_eq!(h.guard.status().message, "Enrolled Alice (2 samples)");

        let users = h.guard.store().list_identities().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].label, "Alice");
        assert_eq!(users[0].sample_count(), 2);
        assert_eq!(h.guard.identities()[0].sample_count(), 2);

        let event = next_matching(&mut h.events, |e| {
            matches!(e, GuardEvent::Enrolled { count: 2, .. })
        })
        .await;
        assert_eq!(
            event,
            GuardEvent::Enrolled {
                label: "Alice".into(),
                count: 2
            }
        );
    }

    #[tokio::test]
    async fn test_enroll_validation() {
        let mut h = harness().await;
        h.guard.attach().await.unwrap();
        assert!(matches!(h.guard.enroll("   ").await, Err(GuardError::EmptyName)));
        assert!(matches!(h.guard.enroll("Bob").await, Err(GuardError::CameraNotLive)));
        assert_eq!(*h.guard.state(), GuardState::Idle);
        assert_eq!(h.guard.status().kind, StatusKind::Error);
    }

    #[tokio::test]
    async fn test_loop_without_users_draws_orange_and_stays_quiet() {
        let mut h = live_harness().await;
        *lock(&h.faces) = vec![detection(10.0, 0.1), detection(200.0, 0.2)];

        let captions = wait_for_captions(&h.canvas, 2).await;
        assert!(captions.iter().all(|c| c == NO_USERS_CAPTION));
        assert_eq!(lock(&h.canvas).pixel(10, 100), Some([0xff, 0x98, 0x00, 0xff]));

        h.guard.stop();
        while let Ok(event) = h.events.try_recv() {
            assert!(!matches!(
                event,
                GuardEvent::Recognized { .. } | GuardEvent::Unknown { .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_loop_recognizes_enrolled_face() {
        let mut h = live_harness().await;
        *lock(&h.faces) = vec![detection(10.0, 0.1)];
        h.guard.enroll("Alice").await.unwrap();

        let event = next_matching(&mut h.events, |e| matches!(e, GuardEvent::Recognized { .. })).await;
        match event {
            GuardEvent::Recognized { label, distance, bbox } => {
                assert_eq!(label, "Alice");
                assert!(distance.abs() < 1e-6);
                assert_eq!(bbox.x, 10.0);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // a face far away from every sample
        *lock(&h.faces) = vec![detection(10.0, 0.9)];
        let event = next_matching(&mut h.events, |e| matches!(e, GuardEvent::Unknown { .. })).await;
        assert!(matches!(event, GuardEvent::Unknown { distance, .. } if distance > 0.55));
    }

    #[tokio::test]
    async fn test_loop_survives_detection_errors() {
        let mut h = harness().await;
        h.guard.attach().await.unwrap();
        h.stats.failures_left.store(3, Ordering::SeqCst);
        *lock(&h.faces) = vec![detection(10.0, 0.1)];
        h.guard.start().await.unwrap();

        let captions = wait_for_captions(&h.canvas, 1).await;
        assert_eq!(captions, vec![NO_USERS_CAPTION.to_string()]);
        assert_eq!(h.stats.failures_left.load(Ordering::SeqCst), 0);
        assert!(h.stats.calls.load(Ordering::SeqCst) >= 4);
        assert_eq!(*h.guard.state(), GuardState::Live);
        while let Ok(event) = h.events.try_recv() {
            assert!(!matches!(event, GuardEvent::Error { .. }));
        }
    }

    #[tokio::test]
    async fn test_one_detection_pass_in_flight() {
        let mut h = live_harness().await;
        *lock(&h.faces) = vec![detection(10.0, 0.1)];
        h.guard.enroll("Alice").await.unwrap();
        h.guard.enroll("Alice").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.stats.calls.load(Ordering::SeqCst) < 10 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("loop kept detecting");
        assert_eq!(h.stats.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loop_draws_face_attributes() {
        let h = live_harness().await;
        let mut face = detection(10.0, 0.1);
        face.attributes = Some(FaceAttributes {
            age: 40.2,
            gender: "male".into(),
            gender_probability: 0.9,
            expressions: vec![("happy".into(), 0.6)],
        });
        *lock(&h.faces) = vec![face];

        let captions = wait_for_captions(&h.canvas, 5).await;
        assert_eq!(captions[0], NO_USERS_CAPTION);
        assert_eq!(captions[2], "Age: 40");
        assert_eq!(captions[4], "Emotion: happy (60.0%)");
    }

    #[tokio::test]
    async fn test_max_faces_limits_pass() {
        let mut h = live_harness().await;
        h.guard.set_max_faces(1);
        *lock(&h.faces) = vec![detection(10.0, 0.1), detection(200.0, 0.2), detection(400.0, 0.3)];
        let captions = wait_for_captions(&h.canvas, 1).await;
        assert_eq!(captions.len(), 1);
        assert_eq!(h.guard.max_faces(), 1);
    }

    #[tokio::test]
    async fn test_threshold_change_rebuilds_matcher() {
        let mut h = live_harness().await;
        assert_eq!(h.guard.matcher_threshold(), None);

        *lock(&h.faces) = vec![detection(10.0, 0.1)];
        h.guard.enroll("Alice").await.unwrap();
        // 416 input tightens the base threshold
        let initial = h.guard.matcher_threshold().unwrap();
        assert!((initial - 0.55 * 0.95).abs() < 1e-6);

        h.guard.set_threshold(0.4);
        let updated = h.guard.matcher_threshold().unwrap();
        assert!((updated - 0.4 * 0.95).abs() < 1e-6);

        h.guard.set_fps(5);
        assert_eq!(h.guard.fps(), 5);
    }

    #[tokio::test]
    async fn test_unusable_threshold_is_ignored() {
        let mut h = live_harness().await;
        *lock(&h.faces) = vec![detection(10.0, 0.1)];
        h.guard.enroll("Alice").await.unwrap();
        let before = h.guard.matcher_threshold();

        for bad in [f32::NAN, f32::INFINITY, 0.0, -0.5] {
            h.guard.set_threshold(bad);
            assert_eq!(h.guard.threshold(), 0.55);
            assert_eq!(h.guard.matcher_threshold(), before);
        }
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let mut h = live_harness().await;
        *lock(&h.faces) = vec![detection(10.0, 0.1)];
        h.guard.enroll("Alice").await.unwrap();
        h.guard.enroll("Bob").await.unwrap();

        assert!(!h.guard.delete_identity("Carol").await.unwrap());
        assert_eq!(h.guard.store().list_identities().await.unwrap().len(), 2);

        assert!(h.guard.delete_identity("Alice").await.unwrap());
        assert_eq!(h.guard.status().message, "Deleted user Alice");
        assert_eq!(h.guard.identities().len(), 1);

        h.guard.clear_identities().await.unwrap();
        assert_eq!(h.guard.status().message, "All users cleared");
        assert!(h.guard.identities().is_empty());
        assert_eq!(h.guard.matcher_threshold(), None);
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let mut h = live_harness().await;
        *lock(&h.faces) = vec![detection(10.0, 0.1)];
        h.guard.enroll("Alice").await.unwrap();
        *lock(&h.faces) = vec![detection(10.0, 0.3)];
        h.guard.enroll("Alice").await.unwrap();

        let snapshot = h.guard.export_snapshot().await.unwrap();
        h.guard.clear_identities().await.unwrap();
        assert_eq!(h.guard.import_snapshot(&snapshot).await.unwrap(), 1);
        assert_eq!(h.guard.status().message, "Imported 1 users");

        let users = h.guard.store().list_identities().await.unwrap();
        assert_eq!(users[0].descriptors, vec![descriptor(0.1), descriptor(0.3)]);
        assert!(h.guard.matcher_threshold().is_some());
    }

    #[tokio::test]
    async fn test_detach_releases_camera() {
        let mut h = live_harness().await;
        let source = h.provider.last_source();
        h.guard.detach();
        assert_eq!(source.stops.load(Ordering::SeqCst), 1);
        drop(h.guard);
        assert_eq!(source.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_engine_descriptor_error_maps_to_invalid_descriptor() {
        let err = GuardError::from(EngineError::Descriptor(DescriptorError::InvalidValue));
        assert!(matches!(err, GuardError::InvalidDescriptor(_)));
        assert_eq!(err.to_string(), "Invalid face descriptor generated");
    }
}
