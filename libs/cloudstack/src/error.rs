use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}: {1}")]
    Http(String, #[source] reqwest::Error),

    #[error("CloudStack API error {code} on {command}: {text}")]
    Api {
        command: String,
        code: i64,
        text: String,
    },

    #[error("async job {job_id} failed with code {code}: {text}")]
    JobFailed {
        job_id: String,
        code: i64,
        text: String,
    },

    #[error("timed out waiting for async job {0}")]
    JobTimeout(String),

    #[error("{0}: {1}")]
    Decode(String, #[source] serde_json::Error),

    #[error("{0}: {1}")]
    UrlParse(String, #[source] url::ParseError),

    #[error("{0}")]
    MissingData(String),

    #[error("unparseable CloudStack version {0:?}")]
    Version(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
