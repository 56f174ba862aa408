use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Handler already registered for queue {queue}"))]
    AlreadyRegistered { queue: String },

    #[snafu(display("Handlers must be registered before the service is initialized"))]
    AlreadyInitialized,

    #[snafu(display("Already disposed"))]
    Disposed,

    #[snafu(display("Unable to decode message from queue {queue}"))]
    Decode {
        queue: String,
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Unable to encode message for queue {queue}"))]
    Encode {
        queue: String,
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Transport operation failed"))]
    Transport {
        #[snafu(source(false))]
        source: eyre::Report,
    },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(eyre::Report, Some)))]
        source: Option<eyre::Report>,
    },
}

impl From<eyre::Report> for Error {
    fn from(source: eyre::Report) -> Self {
        Self::Transport { source }
    }
}

impl Error {
    pub fn transport(e: impl Into<eyre::Report>) -> Self {
        Self::Transport { source: e.into() }
    }

    pub fn already_registered(queue: impl Into<String>) -> Self {
        Self::AlreadyRegistered {
            queue: queue.into(),
        }
    }
}
