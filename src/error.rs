use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Source init error: {0}")]
    SourceInit(String),

    #[error("Detector init error: {0}")]
    DetectorInit(String),

    #[error("Source read error: {0}")]
    SourceRead(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Malformed model output: {0}")]
    MalformedOutput(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },

    #[error("Shutdown timed out, loops still running: {0:?}")]
    ShutdownTimeout(Vec<&'static str>),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[cfg(feature = "opencv")]
    #[error("OpenCV Error: {0}")]
    OpenCv(#[from] opencv::Error),
}
