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
    Kubeconfig(kube::config::KubeconfigError),

    #[from]
    Io(std::io::Error),

    /// Invalid or incomplete configuration, reported before anything starts
    Config(String),

    /// A reconciliation panicked; carries the panic payload when it was a string
    Panic(String),

    /// Custom error message
    Custom(String),
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        match self {
            Self::Config(msg) => write!(fmt, "invalid configuration: {msg}"),
            Self::Panic(msg) => write!(fmt, "reconciliation panicked: {msg}"),
            Self::Custom(msg) => write!(fmt, "{msg}"),
            other => write!(fmt, "{other:?}"),
        }
    }
}

impl std::error::Error for Error {}
