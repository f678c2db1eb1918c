use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("Can not locate an element in web page")]
    NoSuchElement,

    #[error("Waited for element to be located but timed out")]
    Timeout,

    #[error("invalid css selector '{0}'")]
    InvalidSelector(String),

    #[error("invalid plate pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Not a valid emirate name: {0}")]
    UnknownEmirate(String),

    #[error("webdriver error: {0}")]
    WebDriver(String),

    #[error("webdriver process: {0}")]
    Driver(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ScrapeError {
    /// Message logged for a failed call before the run moves on.
    pub fn log_line(&self) -> String {
        match self {
            ScrapeError::NoSuchElement | ScrapeError::Timeout => self.to_string(),
            ScrapeError::UnknownEmirate(_) => "Not a valid emirate name".to_string(),
            other => format!("Exception occurred - {other}"),
        }
    }
}

impl From<ScrapeError> for io::Error {
    fn from(err: ScrapeError) -> Self {
        match err {
            ScrapeError::Io(inner) => inner,
            other => io::Error::other(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ScrapeError>;
