use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use objloader_queue::Queue;
use objloader_types::{Base, Item, ObjectId};
use tracing::{debug, warn};

use crate::error::{DownloadError, DownloadResult};
use crate::pool::{Delivery, Pool};
use crate::traits::{Downloader, PoolOptions};

/// Serves objects from memory.
///
/// Batching and placeholder behavior match [`ServerDownloader`](crate::ServerDownloader),
/// so a loader behaves the same whether it reads from a server or from a
/// graph that is already in hand.
pub struct MemoryDownloader {
    root_id: ObjectId,
    objects: Arc<HashMap<ObjectId, Base>>,
    pool: Pool,
}

impl MemoryDownloader {
    pub fn new(root_id: impl Into<ObjectId>, objects: impl IntoIterator<Item = Base>) -> Self {
        let objects: HashMap<ObjectId, Base> = objects
            .into_iter()
            .map(|base| (base.object_id(), base))
            .collect();
        Self {
            root_id: root_id.into(),
            objects: Arc::new(objects),
            pool: Pool::new("memory-download"),
        }
    }

    pub fn root_id(&self) -> &ObjectId {
        &self.root_id
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl Downloader for MemoryDownloader {
    fn initialize_pool(
        &self,
        results: Arc<dyn Queue<Item>>,
        options: PoolOptions,
    ) -> DownloadResult<()> {
        let objects = Arc::clone(&self.objects);
        self.pool.start(results, options, move |results, batch| {
            let objects = Arc::clone(&objects);
            async move {
                let mut delivery = Delivery::new(&*results);
                for id in batch {
                    let item = match objects.get(&id) {
                        Some(base) => Item::new(base.clone()),
                        None => {
                            warn!(id = %id, "object not in memory graph");
                            Item::not_found(id)
                        }
                    };
                    delivery.send(item).await;
                }
                debug!(delivered = delivery.delivered(), "memory batch served");
                Ok::<(), DownloadError>(())
            }
        })
    }

    fn add(&self, id: ObjectId) {
        self.pool.add(id);
    }

    async fn download_single(&self) -> DownloadResult<Option<Item>> {
        Ok(self.objects.get(&self.root_id).cloned().map(Item::new))
    }

    fn take_error(&self) -> Option<DownloadError> {
        self.pool.take_error()
    }

    async fn dispose_async(&self) {
        self.pool.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objloader_queue::AsyncQueue;
    use serde_json::json;
    use std::time::Duration;

    fn base(id: &str) -> Base {
        Base::from_value(json!({"id": id})).unwrap()
    }

    #[tokio::test]
    async fn serves_root_and_batches() {
        let dl = MemoryDownloader::new("root", [base("root"), base("a"), base("b")]);
        assert_eq!(dl.len(), 3);
        let root = dl.download_single().await.unwrap().unwrap();
        assert_eq!(root.base_id.as_str(), "root");

        let results = Arc::new(AsyncQueue::new());
        dl.initialize_pool(
            results.clone(),
            PoolOptions {
                total: 3,
                max_wait: Duration::from_millis(5),
            },
        )
        .unwrap();
        for id in ["a", "missing", "b"] {
            dl.add(ObjectId::new(id));
        }
        dl.dispose_async().await;

        results.finish();
        let mut got = Vec::new();
        while let Some(item) = results.next().await {
            got.push(item);
        }
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], Item::new(base("a")));
        assert_eq!(got[1], Item::not_found("missing"));
        assert_eq!(got[2], Item::new(base("b")));
    }

    #[tokio::test]
    async fn missing_root_is_none() {
        let dl = MemoryDownloader::new("root", [base("a")]);
        assert!(dl.download_single().await.unwrap().is_none());
    }
}
