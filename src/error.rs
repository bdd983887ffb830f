/// cnbkit error types and helpers
use std::fmt::Display;

/// Main error type for builder and asset operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error("missing required label '{0}'")]
    MissingLabel(String),

    #[error("unable to decode label '{label}': {reason}")]
    LabelMalformed { label: String, reason: String },

    #[error("image {image} missing required env var '{name}'")]
    MissingEnv { image: String, name: String },

    #[error("failed to parse '{name}', value '{value}' should be an integer")]
    NonIntegerId { name: String, value: String },

    #[error(
        "{kind} '{module}' (API {api}) is incompatible with lifecycle '{lifecycle}' (API(s) {supported})"
    )]
    LifecycleIncompatible {
        kind: String,
        module: String,
        api: String,
        lifecycle: String,
        supported: String,
    },

    #[error("buildpack '{module}' does not support stack '{stack}'")]
    StackUnsupported { module: String, stack: String },

    #[error("buildpack '{module}' requires missing mixin(s): {}", .mixins.join(", "))]
    MixinUnsatisfied { module: String, mixins: Vec<String> },

    #[error("{kind} '{module}' does not support target: ({os} {arch}, {distro_name}@{distro_version})")]
    TargetUnsupported {
        kind: String,
        module: String,
        os: String,
        arch: String,
        distro_name: String,
        distro_version: String,
    },

    #[error("buildpack '{reference}' not found on the builder")]
    MissingDependency { reference: String },

    #[error("order of '{module}' contains a cycle through '{through}'")]
    CyclicOrder { module: String, through: String },

    #[error("no versions of {kind} '{id}' were found on the builder")]
    MissingModule { kind: String, id: String },

    #[error("unable to resolve version: multiple versions of '{id}' - must specify an explicit version")]
    AmbiguousVersion { id: String },

    #[error("{kind} '{id}' with version '{version}' was not found on the builder")]
    VersionNotFound {
        kind: String,
        id: String,
        version: String,
    },

    #[error("invalid {kind} descriptor: {reason}")]
    InvalidDescriptor { kind: String, reason: String },

    #[error("invalid lifecycle: {0}")]
    InvalidLifecycle(String),

    #[error("could not find entry path '{0}': not exist")]
    EntryNotExist(String),

    #[error("unsupported protocol '{0}'")]
    UnsupportedScheme(String),

    #[error("could not download from '{uri}', code http status {status}")]
    DownloadFailed { uri: String, status: u16 },

    #[error("validation failed: expected '{expected}', got '{actual}'")]
    ValidationMismatch { expected: String, actual: String },

    #[error("unable to handle locator '{0}'")]
    UnknownLocator(String),

    #[error("the following errors occurred during download: \"{}\"", .0.join(", "))]
    AggregateDownload(Vec<String>),

    #[error("unable to fetch layer '{diff_id}': {reason}")]
    LayerFetchFailed { diff_id: String, reason: String },

    #[error("asset '{sha256}' not found in layer '{diff_id}'")]
    AssetMissingInLayer { sha256: String, diff_id: String },

    #[error("unable to open writer: writer already open")]
    AlreadyOpen,

    #[error("{0}: writer is not open")]
    NotOpen(&'static str),

    #[error("unsupported os '{0}'")]
    UnsupportedOs(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("image '{name}' not found in local store (pull policy {pull_policy})")]
    ImageNotFound {
        name: String,
        pull_policy: crate::config::PullPolicy,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap this error with a short description of the failed operation.
    pub fn context<C: Display>(self, context: C) -> Self {
        Error::Context {
            context: context.to_string(),
            source: Box::new(self),
        }
    }

    /// Innermost typed error, skipping every context layer.
    pub fn root(&self) -> &Error {
        let mut current = self;
        while let Error::Context { source, .. } = current {
            current = source;
        }
        current
    }

    /// Whether the root cause is an absent tar entry.
    pub fn is_entry_not_exist(&self) -> bool {
        matches!(self.root(), Error::EntryNotExist(_))
    }
}

/// Context helpers on fallible results, in the spirit of `anyhow::Context`.
pub trait ResultExt<T> {
    fn context<C: Display>(self, context: C) -> Result<T>;
    fn with_context<C: Display, F: FnOnce() -> C>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context<C: Display>(self, context: C) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<C: Display, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().context(f()))
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            other => std::io::Error::other(other),
        }
    }
}
