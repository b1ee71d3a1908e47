use faceguard_core::{Detection, DescriptorError};
use faceguard_hw::Frame;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to load models from {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },
    #[error("models not loaded")]
    ModelsNotLoaded,
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("invalid descriptor: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Detector tuning for one inference call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectOptions {
    /// Square detector input, a multiple of 32.
    pub input_size: u32,
    /// Minimum detector confidence.
    pub score_threshold: f32,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            input_size: faceguard_core::geometry::MAX_INPUT_SIZE,
            score_threshold: 0.5,
        }
    }
}

/// Face detection and description backend.
///
/// Calls are synchronous and always made from the engine thread, so
/// implementations may block and need not be `Sync`.
pub trait FaceEngine: Send + 'static {
    /// Load detector, landmark and recognition weights from `model_dir`.
    fn load_models(&mut self, model_dir: &Path) -> Result<(), EngineError>;

    /// Every face in `frame`, in detector order.
    fn detect_all(&mut self, frame: &Frame, options: DetectOptions) -> Result<Vec<Detection>, EngineError>;

    /// The single most prominent face, if any.
    fn detect_single(
        &mut self,
        frame: &Frame,
        options: DetectOptions,
    ) -> Result<Option<Detection>, EngineError>;
}

/// Messages sent from the loop and the enrollment path to the engine thread.
enum EngineRequest {
    LoadModels {
        model_dir: PathBuf,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    DetectAll {
        frame: Frame,
        options: DetectOptions,
        reply: oneshot::Sender<Result<Vec<Detection>, EngineError>>,
    },
    DetectSingle {
        frame: Frame,
        options: DetectOptions,
        reply: oneshot::Sender<Result<Option<Detection>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    pub async fn load_models(&self, model_dir: PathBuf) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::LoadModels { model_dir, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn detect_all(
        &self,
        frame: Frame,
        options: DetectOptions,
    ) -> Result<Vec<Detection>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::DetectAll { frame, options, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn detect_single(
        &self,
        frame: Frame,
        options: DetectOptions,
    ) -> Result<Option<Detection>, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineRequest::DetectSingle { frame, options, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    async fn send(&self, request: EngineRequest) -> Result<(), EngineError> {
        self.tx
            .send(request)
            .await
            .map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn `engine` on a dedicated OS thread.
///
/// Requests are served strictly in order. The thread exits once every
/// [`EngineHandle`] has been dropped.
pub fn spawn_engine<E: FaceEngine>(mut engine: E) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("faceguard-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut models_loaded = false;
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::LoadModels { model_dir, reply } => {
                        let result = engine.load_models(&model_dir);
                        match &result {
                            Ok(()) => {
                                models_loaded = true;
                                tracing::info!(path = %model_dir.display(), "models loaded");
                            }
                            Err(e) => tracing::error!(error = %e, "model load failed"),
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::DetectAll { frame, options, reply } => {
                        let result = if models_loaded {
                            engine.detect_all(&frame, options)
                        } else {
                            Err(EngineError::ModelsNotLoaded)
                        };
                        let _ = reply.send(result);
                    }
                    EngineRequest::DetectSingle { frame, options, reply } => {
                        let result = if models_loaded {
                            engine.detect_single(&frame, options)
                        } else {
                            Err(EngineError::ModelsNotLoaded)
                        };
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}
