use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{self, Stream};
use objloader_cache::{DefermentManager, MemoryCache};
use objloader_download::{
    DownloadError, Downloader, MemoryDownloader, PoolOptions, ServerDownloader,
    ServerDownloaderOptions,
};
use objloader_queue::{AggregateQueue, AsyncQueue, Queue};
use objloader_store::{Database, MemoryDatabase};
use objloader_types::{Base, Item, ObjectId};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::{SdkError, SdkResult};
use crate::options::LoaderOptions;
use crate::reader::{CacheReader, InlineCacheReader, WorkerCacheReader};
use crate::writer::{CacheWriter, InlineCacheWriter, RequestItem, WorkerCacheWriter};

/// Forwards store misses to the downloader.
struct DownloadRequests(Arc<dyn Downloader>);

impl Queue<ObjectId> for DownloadRequests {
    fn add(&self, id: ObjectId) {
        self.0.add(id);
    }
}

enum Walk {
    Root,
    Children(HashSet<ObjectId>),
    Done,
}

/// Loads an object graph: the root, then everything in its closure.
///
/// Objects come from the local store when present and from the downloader
/// otherwise; downloaded objects are written back to the store. Must be
/// created inside a tokio runtime.
///
/// ```ignore
/// let loader = ObjectLoader::from_server(server_options, database, LoaderOptions::default())?;
/// let mut objects = std::pin::pin!(loader.get_object_iterator());
/// while let Some(base) = objects.next().await {
///     println!("{}", base?.id());
/// }
/// loader.dispose_async().await;
/// ```
pub struct ObjectLoader {
    root_id: ObjectId,
    options: LoaderOptions,
    database: Arc<dyn Database>,
    downloader: Arc<dyn Downloader>,
    cache: Arc<MemoryCache>,
    deferments: Arc<DefermentManager>,
    reader: Arc<dyn CacheReader>,
    writer: Arc<dyn CacheWriter>,
    gathered: Arc<AsyncQueue<Item>>,
    root: OnceCell<Option<Item>>,
    iterating: AtomicBool,
    disposed: AtomicBool,
}

impl ObjectLoader {
    pub fn new(
        root_id: ObjectId,
        database: Arc<dyn Database>,
        downloader: Arc<dyn Downloader>,
        options: LoaderOptions,
    ) -> SdkResult<Self> {
        let cache = Arc::new(MemoryCache::new(&options.cache));
        cache.start_sweeper();
        let deferments = Arc::new(DefermentManager::new(Arc::clone(&cache)));

        let reader = if options.use_read_worker {
            WorkerCacheReader::spawn(
                Arc::clone(&database),
                Arc::clone(&deferments),
                options.read_options(),
                options.worker_buffer_capacity,
            )? as Arc<dyn CacheReader>
        } else {
            InlineCacheReader::new(
                Arc::clone(&database),
                Arc::clone(&deferments),
                options.read_options(),
            ) as Arc<dyn CacheReader>
        };

        let weak = Arc::downgrade(&reader);
        let request: RequestItem = Arc::new(move |id: &ObjectId| {
            if let Some(reader) = weak.upgrade() {
                reader.request_item(id);
            }
        });
        let writer = if options.use_write_worker {
            Arc::new(WorkerCacheWriter::spawn(
                Arc::clone(&database),
                Arc::clone(&deferments),
                request,
                options.write_options(),
                options.worker_buffer_capacity,
            )?) as Arc<dyn CacheWriter>
        } else {
            Arc::new(InlineCacheWriter::new(
                Arc::clone(&database),
                Arc::clone(&deferments),
                request,
                options.write_options(),
            )) as Arc<dyn CacheWriter>
        };

        let gathered: Arc<AsyncQueue<Item>> = Arc::new(AsyncQueue::new());
        reader.initialize_queue(
            Arc::clone(&gathered) as Arc<dyn Queue<Item>>,
            Arc::new(DownloadRequests(Arc::clone(&downloader))),
        )?;

        debug!(
            root = %root_id,
            read_worker = options.use_read_worker,
            write_worker = options.use_write_worker,
            "object loader created"
        );
        Ok(Self {
            root_id,
            options,
            database,
            downloader,
            cache,
            deferments,
            reader,
            writer,
            gathered,
            root: OnceCell::new(),
            iterating: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    // ---- Factories ----

    /// Load from a server, caching in `database`.
    pub fn from_server(
        server: ServerDownloaderOptions,
        database: Arc<dyn Database>,
        options: LoaderOptions,
    ) -> SdkResult<Self> {
        let downloader = ServerDownloader::new(server)?;
        let root_id = downloader.object_id().clone();
        Self::new(root_id, database, Arc::new(downloader), options)
    }

    /// Load a graph that is already in memory.
    pub fn from_objects(
        root_id: impl Into<ObjectId>,
        objects: impl IntoIterator<Item = Base>,
        options: LoaderOptions,
    ) -> SdkResult<Self> {
        let root_id = root_id.into();
        let downloader = MemoryDownloader::new(root_id.clone(), objects);
        Self::new(
            root_id,
            Arc::new(MemoryDatabase::new()),
            Arc::new(downloader),
            options,
        )
    }

    /// Load a graph from a JSON array of objects. The first object is the root.
    pub fn from_json(json: &str, options: LoaderOptions) -> SdkResult<Self> {
        let values: Vec<Value> =
            serde_json::from_str(json).map_err(|e| SdkError::InvalidGraph(e.to_string()))?;
        let objects = values
            .into_iter()
            .map(Base::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        let root_id = objects
            .first()
            .map(Base::object_id)
            .ok_or_else(|| SdkError::InvalidGraph("no objects".to_string()))?;
        Self::from_objects(root_id, objects, options)
    }

    // ---- Queries ----

    pub fn root_id(&self) -> &ObjectId {
        &self.root_id
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    /// Objects persisted through this loader so far.
    pub fn written(&self) -> usize {
        self.writer.written()
    }

    /// The root object, from the local store or else the network.
    ///
    /// Resolved once; later calls return the same answer. Resolving the root
    /// starts the download pool, sized by the root's closure.
    pub async fn get_root_object(&self) -> SdkResult<Option<Item>> {
        self.check_open()?;
        let root = self.root.get_or_try_init(|| self.resolve_root()).await?;
        Ok(root.clone())
    }

    /// One object by id, waiting for it to be read or downloaded.
    pub async fn get_object(&self, id: &ObjectId) -> SdkResult<Base> {
        self.get_root_object().await?;
        self.reader.get_object(id).await
    }

    /// The root plus every object in its closure; 0 when there is no root.
    pub async fn get_total_object_count(&self) -> SdkResult<usize> {
        Ok(match self.get_root_object().await? {
            Some(root) => root.base.map_or(0, |base| base.closure().len() + 1),
            None => 0,
        })
    }

    /// Every object in the graph, root first.
    ///
    /// Children arrive in whatever order the store and the network answer.
    /// Objects the source does not have are skipped. An object that fails to
    /// decode yields a `Decode` error and the stream carries on. If
    /// downloading fails the stream ends with the download error. Only one
    /// iterator may run per loader.
    pub fn get_object_iterator(&self) -> impl Stream<Item = SdkResult<Base>> + '_ {
        let start = if self.iterating.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Walk::Root)
        };
        stream::unfold(start, move |walk| async move {
            match walk {
                None => Some((
                    Err(SdkError::AlreadyInitialized("object iterator")),
                    Some(Walk::Done),
                )),
                Some(walk) => self
                    .step(walk)
                    .await
                    .map(|(next, walk)| (next, Some(walk))),
            }
        })
    }

    async fn step(&self, walk: Walk) -> Option<(SdkResult<Base>, Walk)> {
        match walk {
            Walk::Root => match self.get_root_object().await {
                Err(e) => Some((Err(e), Walk::Done)),
                Ok(None) => {
                    warn!(root = %self.root_id, "root object not found; nothing to load");
                    None
                }
                Ok(Some(root)) => {
                    let base = root.base.clone()?;
                    self.undefer(root);
                    let children = children_by_depth(&base);
                    info!(root = %self.root_id, count = children.len(), "loading closure");
                    self.reader.request_all(&children);
                    Some((Ok(base), Walk::Children(children.into_iter().collect())))
                }
            },
            Walk::Children(mut expected) => loop {
                if expected.is_empty() {
                    debug!(root = %self.root_id, "closure complete");
                    return None;
                }
                let Some(item) = self.gathered.next().await else {
                    return match self.downloader.take_error() {
                        Some(e) => Some((Err(e.into()), Walk::Done)),
                        None => {
                            warn!(outstanding = expected.len(), "object stream ended early");
                            None
                        }
                    };
                };
                if !expected.remove(&item.base_id) {
                    debug!(id = %item.base_id, "skipping object outside the closure");
                    continue;
                }
                let base = item.base.clone();
                let failure = item.error.clone().map(|reason| DownloadError::Decode {
                    id: item.base_id.as_str().to_string(),
                    reason,
                });
                self.undefer(item);
                match (base, failure) {
                    (Some(base), _) => return Some((Ok(base), Walk::Children(expected))),
                    (None, Some(e)) => return Some((Err(e.into()), Walk::Children(expected))),
                    (None, None) => continue,
                }
            },
            Walk::Done => None,
        }
    }

    // ---- Internals ----

    async fn resolve_root(&self) -> SdkResult<Option<Item>> {
        let database = Arc::clone(&self.database);
        let id = self.root_id.clone();
        let stored = tokio::task::spawn_blocking(move || database.get(&id)).await??;
        if let Some(root) = stored.filter(Item::is_resolved) {
            debug!(root = %self.root_id, "root found in local store");
            self.start_downloads(&root)?;
            return Ok(Some(root));
        }

        let downloaded = self.downloader.download_single().await?;
        let Some(root) = downloaded.filter(Item::is_resolved) else {
            return Ok(None);
        };
        info!(root = %self.root_id, "root downloaded");
        self.start_downloads(&root)?;
        self.writer.add(root.clone());
        Ok(Some(root))
    }

    fn start_downloads(&self, root: &Item) -> SdkResult<()> {
        let total = root.base.as_ref().map_or(0, |base| base.closure().len());
        let results =
            AggregateQueue::<Item, _, _>::new(Arc::clone(&self.gathered), Arc::clone(&self.writer));
        self.downloader.initialize_pool(
            Arc::new(results),
            PoolOptions {
                total,
                max_wait: self.options.download_wait(),
            },
        )?;
        Ok(())
    }

    fn undefer(&self, item: Item) {
        let id = item.base_id.clone();
        if let Err(e) = self
            .deferments
            .undefer(item, &mut |child| self.reader.request_item(child))
        {
            debug!(id = %id, error = %e, "not undeferring loaded object");
        }
    }

    fn check_open(&self) -> SdkResult<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(SdkError::Disposed("object loader"));
        }
        Ok(())
    }

    /// Stop every stage and release the store.
    ///
    /// The downloader is drained first so that everything it delivered
    /// reaches the writer; the writer then flushes to the store.
    pub async fn dispose_async(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.gathered.dispose();
        self.downloader.dispose_async().await;
        tokio::join!(self.writer.dispose_async(), self.reader.dispose_async());
        self.deferments.dispose();
        self.cache.dispose();
        if let Err(e) = self.database.dispose() {
            warn!(error = %e, "failed to dispose local store");
        }
        info!(root = %self.root_id, written = self.writer.written(), "object loader disposed");
    }
}

/// Closure ids, deepest first. Ties keep the manifest's order.
fn children_by_depth(root: &Base) -> Vec<ObjectId> {
    let mut closure = root.closure();
    closure.sort_by(|a, b| b.1.cmp(&a.1));
    closure.into_iter().map(|(id, _)| id).collect()
}
