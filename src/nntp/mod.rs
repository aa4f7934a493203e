pub mod connection;
pub mod error;
pub mod pool;
pub mod speed;
pub mod yenc;

use async_trait::async_trait;
use bytes::Bytes;

pub use connection::{NntpConnection, NntpStatus};
pub use error::NntpError;
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use speed::SpeedMeter;

/// What the loader, validator and proxy need from a provider. Production
/// implementation is [`ConnectionPool`]; tests substitute in-memory fakes.
#[async_trait]
pub trait ArticleSource: Send + Sync {
    fn host(&self) -> &str;

    /// Lower number = tried first.
    fn priority(&self) -> u8;

    fn enabled(&self) -> bool;

    /// `STAT`: does the article exist on this provider?
    async fn stat(&self, message_id: &str) -> Result<bool, NntpError>;

    /// `BODY`: raw (still yEnc-encoded) article body.
    async fn body(&self, message_id: &str) -> Result<Bytes, NntpError>;

    /// `ARTICLE`: headers + body.
    async fn article(&self, message_id: &str) -> Result<Bytes, NntpError>;

    /// `HEAD`: headers only.
    async fn head(&self, message_id: &str) -> Result<Bytes, NntpError>;

    /// `GROUP`: select a group, returning the `211` payload.
    async fn group(&self, name: &str) -> Result<String, NntpError>;
}
