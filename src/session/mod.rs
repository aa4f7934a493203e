use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use thiserror::Error;
use tokio::sync::{OnceCell, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::archive::{self, ArchiveError, Blueprint, ByteSource};
use crate::indexer::{Aggregator, IndexerError};
use crate::loader::{NzbFileReader, PooledFetcher, SegmentCache, segment_cache};
use crate::nntp::ArticleSource;
use crate::nzb::{Nzb, NzbError, NzbParser};

/// Eviction tick cadence.
const EVICTION_INTERVAL: Duration = Duration::from_secs(30);
/// A playback entry counts as active if it read within this window.
const PLAYBACK_ACTIVE_WINDOW: Duration = Duration::from_secs(30);
/// Decoded-segment LRU budget per session, in bytes.
const SEGMENT_CACHE_BYTES: u64 = 256 << 20;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,

    #[error("NZB download failed")]
    Download(#[from] IndexerError),

    #[error("NZB parse failed")]
    Nzb(#[from] NzbError),

    #[error("No indexer named {0}")]
    UnknownIndexer(String),
}

/// Where a deferred session fetches its NZB from on first playback.
#[derive(Debug, Clone)]
pub struct DeferredDescriptor {
    pub url: String,
    /// Indexer name used for oracle bookkeeping.
    pub indexer_name: String,
    pub title: String,
    /// Name of the configured backend that downloads the NZB.
    pub source_indexer: String,
}

/// Parsed NZB plus the ordered per-file readers. The cache handle is
/// retained so the per-session LRU lives exactly as long as its readers.
pub struct LoadedContent {
    pub nzb: Nzb,
    pub files: Vec<Arc<NzbFileReader>>,
    _cache: SegmentCache,
}

impl LoadedContent {
    pub fn byte_sources(&self) -> Vec<Arc<dyn ByteSource>> {
        self.files
            .iter()
            .map(|f| Arc::clone(f) as Arc<dyn ByteSource>)
            .collect()
    }
}

/// One live release, keyed by its content fingerprint.
pub struct Session {
    pub id: String,
    pub guid: String,
    pub indexer_name: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    deferred: Option<DeferredDescriptor>,
    content: OnceCell<Arc<LoadedContent>>,
    blueprint: OnceCell<Arc<Blueprint>>,
    last_active: std::sync::RwLock<Instant>,
    /// clientIP -> last read.
    playback: std::sync::Mutex<HashMap<String, Instant>>,
}

impl Session {
    fn base(id: String, guid: String, indexer_name: String, title: String) -> Self {
        Self {
            id,
            guid,
            indexer_name,
            title,
            created_at: Utc::now(),
            deferred: None,
            content: OnceCell::new(),
            blueprint: OnceCell::new(),
            last_active: std::sync::RwLock::new(Instant::now()),
            playback: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn is_deferred(&self) -> bool {
        self.content.get().is_none() && self.deferred.is_some()
    }

    pub fn deferred_descriptor(&self) -> Option<&DeferredDescriptor> {
        self.deferred.as_ref()
    }

    pub fn touch(&self) {
        *self.last_active.write().unwrap() = Instant::now();
    }

    pub fn start_playback(&self, client_ip: &str) {
        self.touch();
        self.playback
            .lock()
            .unwrap()
            .insert(client_ip.to_string(), Instant::now());
    }

    pub fn keep_alive(&self, client_ip: &str) {
        self.touch();
        if let Some(entry) = self.playback.lock().unwrap().get_mut(client_ip) {
            *entry = Instant::now();
        }
    }

    pub fn end_playback(&self, client_ip: &str) {
        self.touch();
        self.playback.lock().unwrap().remove(client_ip);
    }

    pub fn active_playbacks(&self) -> usize {
        let now = Instant::now();
        self.playback
            .lock()
            .unwrap()
            .values()
            .filter(|last| now.duration_since(**last) <= PLAYBACK_ACTIVE_WINDOW)
            .count()
    }

    fn evictable(&self, idle_ttl: Duration) -> bool {
        if self.active_playbacks() > 0 {
            return false;
        }
        let last = *self.last_active.read().unwrap();
        Instant::now().duration_since(last) > idle_ttl
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub guid: String,
    pub title: String,
    pub indexer: String,
    pub created_at: DateTime<Utc>,
    pub deferred: bool,
    pub active_clients: usize,
}

/// Content-addressed live session table with keep-alive eviction.
///
/// Sessions hold no pool references; readers are built with the pool list
/// current at load time, and `update_pools` swaps the list for sessions
/// loaded afterwards.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    pools: RwLock<Vec<Arc<dyn ArticleSource>>>,
    aggregator: Arc<Aggregator>,
    idle_ttl: Duration,
}

impl SessionManager {
    pub fn new(
        pools: Vec<Arc<dyn ArticleSource>>,
        aggregator: Arc<Aggregator>,
        idle_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            pools: RwLock::new(pools),
            aggregator,
            idle_ttl,
        })
    }

    /// Swap the provider pool list on config reload.
    pub async fn update_pools(&self, pools: Vec<Arc<dyn ArticleSource>>) {
        *self.pools.write().await = pools;
    }

    /// Create (or return) the session for a validated NZB. The id is the
    /// NZB content hash, so concurrent creators converge on one instance
    /// and a second create has no side effects.
    pub async fn create_session(
        &self,
        nzb: Nzb,
        guid: String,
        indexer_name: String,
        title: String,
    ) -> Arc<Session> {
        let id = nzb.hash();

        if let Some(existing) = self.sessions.read().await.get(&id) {
            return Arc::clone(existing);
        }

        let content = self.build_content(nzb).await;
        let mut sessions = self.sessions.write().await;
        // Double-checked: someone may have inserted while we built readers.
        if let Some(existing) = sessions.get(&id) {
            return Arc::clone(existing);
        }

        let mut session = Session::base(id.clone(), guid, indexer_name, title);
        session.content = OnceCell::new_with(Some(Arc::new(content)));
        let session = Arc::new(session);
        sessions.insert(id.clone(), Arc::clone(&session));
        info!(session = %id, "session created");
        session
    }

    /// Create (or return) a deferred session: the NZB URL is stored and
    /// fetched once on first playback. Id is `md5(guid)`.
    pub async fn create_deferred_session(
        &self,
        url: String,
        indexer_name: String,
        title: String,
        source_indexer: String,
        guid: String,
    ) -> Arc<Session> {
        let id = hex::encode(Md5::new().chain_update(guid.as_bytes()).finalize());

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&id) {
            return Arc::clone(existing);
        }

        let mut session = Session::base(id.clone(), guid, indexer_name.clone(), title.clone());
        session.deferred = Some(DeferredDescriptor {
            url,
            indexer_name,
            title,
            source_indexer,
        });
        let session = Arc::new(session);
        sessions.insert(id.clone(), Arc::clone(&session));
        info!(session = %id, "deferred session created");
        session
    }

    pub async fn get_session(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .read()
            .await
            .get(id)
            .map(Arc::clone)
            .ok_or(SessionError::NotFound)
    }

    pub async fn delete_session(&self, id: &str) {
        if self.sessions.write().await.remove(id).is_some() {
            debug!(session = %id, "session deleted");
        }
    }

    /// Resolve the session's content, downloading and parsing the deferred
    /// NZB at most once; concurrent callers wait on the same future.
    pub async fn ensure_content(
        &self,
        session: &Arc<Session>,
    ) -> Result<Arc<LoadedContent>, SessionError> {
        let content = session
            .content
            .get_or_try_init(|| async {
                let deferred = session.deferred.as_ref().ok_or(SessionError::NotFound)?;
                let indexer = self
                    .aggregator
                    .by_name(&deferred.source_indexer)
                    .ok_or_else(|| SessionError::UnknownIndexer(deferred.source_indexer.clone()))?;

                info!(session = %session.id, url = %deferred.url, "downloading deferred NZB");
                let bytes = indexer.download_nzb(&deferred.url).await?;
                let nzb = NzbParser::parse(Cursor::new(&bytes[..]))?;
                Ok::<_, SessionError>(Arc::new(self.build_content(nzb).await))
            })
            .await?;
        Ok(Arc::clone(content))
    }

    /// Build (once) the archive blueprint for the session's media file.
    pub async fn ensure_blueprint(
        &self,
        session: &Arc<Session>,
        content: &LoadedContent,
    ) -> Result<Arc<Blueprint>, ArchiveError> {
        let blueprint = session
            .blueprint
            .get_or_try_init(|| async {
                let sources = content.byte_sources();
                archive::build_blueprint(&content.nzb.files, &sources)
                    .await
                    .map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(blueprint))
    }

    async fn build_content(&self, nzb: Nzb) -> LoadedContent {
        let pools = self.pools.read().await.clone();
        let fetcher = Arc::new(PooledFetcher::new(pools));
        let cache = segment_cache(SEGMENT_CACHE_BYTES);

        let files = nzb
            .files
            .iter()
            .map(|file| {
                Arc::new(NzbFileReader::new(
                    file.clone(),
                    Arc::clone(&fetcher) as Arc<dyn crate::loader::SegmentFetcher>,
                    cache.clone(),
                ))
            })
            .collect();

        LoadedContent {
            nzb,
            files,
            _cache: cache,
        }
    }

    pub async fn start_playback(&self, id: &str, client_ip: &str) -> Result<(), SessionError> {
        self.get_session(id).await?.start_playback(client_ip);
        Ok(())
    }

    pub async fn keep_alive(&self, id: &str, client_ip: &str) -> Result<(), SessionError> {
        self.get_session(id).await?.keep_alive(client_ip);
        Ok(())
    }

    pub async fn end_playback(&self, id: &str, client_ip: &str) -> Result<(), SessionError> {
        self.get_session(id).await?.end_playback(client_ip);
        Ok(())
    }

    pub async fn active_sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| SessionInfo {
                id: s.id.clone(),
                guid: s.guid.clone(),
                title: s.title.clone(),
                indexer: s.indexer_name.clone(),
                created_at: s.created_at,
                deferred: s.is_deferred(),
                active_clients: s.active_playbacks(),
            })
            .collect()
    }

    /// Remove sessions idle beyond the TTL with no active playback.
    pub async fn evict_idle(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, session| {
            let keep = !session.evictable(self.idle_ttl);
            if !keep {
                info!(session = %id, "evicting idle session");
            }
            keep
        });
        before - sessions.len()
    }

    /// Background eviction tick, every 30 s.
    pub fn spawn_eviction(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(EVICTION_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let evicted = manager.evict_idle().await;
                if evicted > 0 {
                    debug!(evicted, "eviction pass complete");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::{Category, Indexer, IndexerError, Item, SearchRequest};
    use crate::usage::Usage;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn nzb_fixture(id_prefix: &str) -> Nzb {
        use crate::nzb::{NzbFile, NzbSegment};
        let mut file = NzbFile::new("f".into(), "p".into(), Utc::now());
        file.path = "movie.mkv".into();
        file.add_segment(NzbSegment {
            message_id: format!("{id_prefix}@x"),
            number: 1,
            bytes: 1000,
        });
        file.finish_segments();
        let mut nzb = Nzb::new();
        nzb.files.push(file);
        nzb
    }

    struct CountingIndexer {
        downloads: AtomicUsize,
    }

    #[async_trait]
    impl Indexer for CountingIndexer {
        fn name(&self) -> &str {
            "stub"
        }

        async fn search(&self, _r: &SearchRequest) -> Result<Vec<Item>, IndexerError> {
            Ok(vec![])
        }

        async fn download_nzb(&self, _url: &str) -> Result<Bytes, IndexerError> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            // A yield widens the race window for the once-guard test.
            tokio::task::yield_now().await;
            Ok(Bytes::from_static(
                br#"<nzb><file subject="&quot;movie.mkv&quot;"><segments>
                    <segment bytes="1000" number="1">a@x</segment>
                </segments></file></nzb>"#,
            ))
        }

        async fn ping(&self) -> Result<(), IndexerError> {
            Ok(())
        }

        async fn usage(&self) -> Usage {
            Usage {
                api_hits_limit: None,
                api_hits_used: 0,
                api_hits_remaining: None,
                downloads_limit: None,
                downloads_used: 0,
                downloads_remaining: None,
                all_time_api_hits: 0,
                all_time_downloads: 0,
            }
        }

        async fn resolve_download_url(
            &self,
            _u: &str,
            _t: &str,
            _s: u64,
            _c: Category,
        ) -> Option<String> {
            None
        }
    }

    fn manager_with(indexer: Arc<dyn Indexer>, ttl: Duration) -> Arc<SessionManager> {
        SessionManager::new(vec![], Arc::new(Aggregator::new(vec![indexer])), ttl)
    }

    fn manager(ttl: Duration) -> Arc<SessionManager> {
        manager_with(
            Arc::new(CountingIndexer {
                downloads: AtomicUsize::new(0),
            }),
            ttl,
        )
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let m = manager(Duration::from_secs(300));
        let a = m
            .create_session(nzb_fixture("a"), "g".into(), "idx".into(), "T".into())
            .await;
        let b = m
            .create_session(nzb_fixture("a"), "g".into(), "idx".into(), "T".into())
            .await;

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(m.active_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn deferred_id_is_md5_of_guid() {
        let m = manager(Duration::from_secs(300));
        let s = m
            .create_deferred_session(
                "http://x/nzb".into(),
                "idx".into(),
                "T".into(),
                "stub".into(),
                "X".into(),
            )
            .await;

        let expected = hex::encode(Md5::new().chain_update(b"X").finalize());
        assert_eq!(s.id, expected);
        assert!(s.is_deferred());
    }

    #[tokio::test]
    async fn deferred_download_happens_once() {
        let indexer = Arc::new(CountingIndexer {
            downloads: AtomicUsize::new(0),
        });
        let m = manager_with(
            Arc::clone(&indexer) as Arc<dyn Indexer>,
            Duration::from_secs(300),
        );

        let s = m
            .create_deferred_session(
                "http://x/nzb".into(),
                "idx".into(),
                "T".into(),
                "stub".into(),
                "G".into(),
            )
            .await;

        let (a, b) = tokio::join!(m.ensure_content(&s), m.ensure_content(&s));
        let a = a.unwrap();
        let b = b.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(indexer.downloads.load(Ordering::SeqCst), 1);
        assert!(!s.is_deferred());
        assert_eq!(a.nzb.files[0].path, "movie.mkv");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_evict_after_ttl() {
        let m = manager(Duration::from_secs(60));
        let s = m
            .create_session(nzb_fixture("e"), "g".into(), "idx".into(), "T".into())
            .await;
        let id = s.id.clone();
        drop(s);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(m.evict_idle().await, 0);

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(m.evict_idle().await, 1);
        assert!(matches!(
            m.get_session(&id).await,
            Err(SessionError::NotFound)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_prevents_eviction() {
        let m = manager(Duration::from_secs(60));
        let s = m
            .create_session(nzb_fixture("k"), "g".into(), "idx".into(), "T".into())
            .await;

        s.start_playback("10.0.0.1");
        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(20)).await;
            s.keep_alive("10.0.0.1");
        }
        // Two minutes in, keep-alives kept it active.
        assert_eq!(m.evict_idle().await, 0);

        s.end_playback("10.0.0.1");
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(m.evict_idle().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn two_clients_keep_session_alive_independently() {
        let m = manager(Duration::from_secs(60));
        let s = m
            .create_session(nzb_fixture("c"), "g".into(), "idx".into(), "T".into())
            .await;

        s.start_playback("10.0.0.1");
        s.start_playback("10.0.0.2");

        for _ in 0..15 {
            tokio::time::advance(Duration::from_secs(20)).await;
            s.keep_alive("10.0.0.1");
            s.keep_alive("10.0.0.2");
        }
        // Five minutes of playback from both clients.
        assert_eq!(m.evict_idle().await, 0);

        s.end_playback("10.0.0.1");
        s.end_playback("10.0.0.2");
        tokio::time::advance(Duration::from_secs(91)).await;
        assert_eq!(m.evict_idle().await, 1);
    }
}
