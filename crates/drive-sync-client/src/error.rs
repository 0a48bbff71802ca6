use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("request failed: {0}")]
    Http(String),
    #[error("not authenticated")]
    Unauthorized,
    #[error("api error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("session file error: {0}")]
    Session(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ClientError::Decode(err.to_string())
        } else {
            ClientError::Http(err.to_string())
        }
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        ClientError::Config(err.to_string())
    }
}
