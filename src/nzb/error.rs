use thiserror::Error;

#[derive(Error, Debug)]
pub enum NzbError {
    #[error("NZB parse error: {0}")]
    Parse(String),

    #[error("NZB contains no files")]
    Empty,

    #[error("Empty message id in file: {0}")]
    MissingMessageId(String),
}
