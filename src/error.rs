use derive_more::From;
use k8s_openapi::serde_json;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Json(serde_json::Error),

    #[from]
    Kube(kube::Error),

    #[from]
    Infer(kube::config::InferConfigError),

    #[from]
    HttpHeader(hyper::header::InvalidHeaderValue),

    /// Bad construction arguments; fatal and surfaced immediately
    Configuration(String),

    /// A list or watch call against the registry failed
    Registry(String),

    /// The initial listing failed, the synchronizer will never become ready
    SyncFailure(Box<Error>),

    /// An observer callback panicked while handling an event
    ObserverPanic { observer: String, message: String },
}

impl Error {
    /// True for failures that end a synchronizer instance
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::SyncFailure(_))
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::Json(e) => write!(fmt, "json error: {e}"),
            Self::Kube(e) => write!(fmt, "kube error: {e}"),
            Self::Infer(e) => write!(fmt, "kubeconfig error: {e}"),
            Self::HttpHeader(e) => write!(fmt, "invalid header: {e}"),
            Self::Configuration(msg) => write!(fmt, "configuration error: {msg}"),
            Self::Registry(msg) => write!(fmt, "registry error: {msg}"),
            Self::SyncFailure(cause) => write!(fmt, "initial sync failed: {cause}"),
            Self::ObserverPanic { observer, message } => {
                write!(fmt, "observer {observer} panicked: {message}")
            }
        }
    }
}

impl std::error::Error for Error {}
