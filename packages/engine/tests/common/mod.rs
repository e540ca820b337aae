//! Shared harness for end-to-end scenario tests.
//!
//! Builds a full engine kernel over the in-memory doubles plus scripted
//! generator/store mocks, so whole dispatch cycles run without a database,
//! broker service, or network.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use engine_core::kernel::generator::GeneratorError;
use engine_core::kernel::jobs::testing::MemoryJobStore;
use engine_core::kernel::store_api::{
    ArticleSnapshot, LiveSeo, MediaImage, ProductSnapshot, SeoFlags, StoreApi, StoreApiFactory,
    StoreCallError,
};
use engine_core::kernel::{
    CallObserver, Dispatcher, EngineKernel, EngineSettings, Generator, GeneratorConfig, ItemSpec,
    Job, JobItem, JobSpec, JobStore, JobType, MemoryBroker, MemoryTenantDirectory,
    MemoryTenantLocks, MemoryUsageLedger, Plan, Producer, TargetType, TextCompleter,
};

pub const DEFAULT_SEO_JSON: &str = r#"{"seoTitle":"A","seoDescription":"B"}"#;

// ---------------------------------------------------------------------------
// Scripted generator
// ---------------------------------------------------------------------------

struct CancelHook {
    store: Arc<MemoryJobStore>,
    job_id: String,
    at_call: u32,
}

/// Scripted [`TextCompleter`]: queued responses first, then a default.
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<String, GeneratorError>>>,
    default_response: Mutex<String>,
    calls: AtomicU32,
    cancel_hook: Mutex<Option<CancelHook>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default_response: Mutex::new(DEFAULT_SEO_JSON.to_string()),
            calls: AtomicU32::new(0),
            cancel_hook: Mutex::new(None),
        }
    }

    pub fn push(&self, response: Result<String, GeneratorError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn push_service_unavailable(&self) {
        self.push(Err(GeneratorError::Api {
            status: 503,
            message: "service unavailable".into(),
            retry_after_secs: None,
        }));
    }

    pub fn set_default_response(&self, body: &str) {
        *self.default_response.lock().unwrap() = body.to_string();
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Cancel `job_id` through the store when call number `at_call` arrives,
    /// simulating a user cancelling mid-phase.
    pub fn cancel_job_at_call(&self, store: Arc<MemoryJobStore>, job_id: &str, at_call: u32) {
        *self.cancel_hook.lock().unwrap() = Some(CancelHook {
            store,
            job_id: job_id.to_string(),
            at_call,
        });
    }
}

#[async_trait]
impl TextCompleter for ScriptedGenerator {
    async fn complete_json(&self, _system: &str, _user: &str) -> Result<String, GeneratorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let due_hook = {
            let mut hook = self.cancel_hook.lock().unwrap();
            if hook.as_ref().map(|h| h.at_call == call).unwrap_or(false) {
                hook.take()
            } else {
                None
            }
        };
        if let Some(hook) = due_hook {
            hook.store
                .cancel_job(&hook.job_id, "Cancelled by user")
                .await
                .ok();
        }
        match self.responses.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Ok(self.default_response.lock().unwrap().clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Mock store API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum WriteRecord {
    ProductSeo {
        id: String,
        title: Option<String>,
        description: Option<String>,
    },
    ArticleSeo {
        id: String,
        title: Option<String>,
        description: Option<String>,
    },
    ImageAlt {
        product_id: String,
        media_id: String,
        alt: String,
    },
}

/// Scripted [`StoreApi`] with a small in-memory catalog.
#[derive(Default)]
pub struct MockStoreApi {
    pub products: Mutex<HashMap<String, ProductSnapshot>>,
    pub articles: Mutex<HashMap<String, ArticleSnapshot>>,
    /// Target id (or media id) -> error returned by writes against it.
    pub write_failures: Mutex<HashMap<String, StoreCallError>>,
    pub writes: Mutex<Vec<WriteRecord>>,
}

impl MockStoreApi {
    pub fn add_product(&self, snapshot: ProductSnapshot) {
        self.products
            .lock()
            .unwrap()
            .insert(snapshot.id.clone(), snapshot);
    }

    pub fn add_article(&self, snapshot: ArticleSnapshot) {
        self.articles
            .lock()
            .unwrap()
            .insert(snapshot.id.clone(), snapshot);
    }

    pub fn fail_writes_for(&self, target_id: &str, error: StoreCallError) {
        self.write_failures
            .lock()
            .unwrap()
            .insert(target_id.to_string(), error);
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().unwrap().clone()
    }

    fn failure_for(&self, key: &str) -> Option<StoreCallError> {
        self.write_failures.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl StoreApi for MockStoreApi {
    async fn fetch_product(&self, id: &str) -> Result<ProductSnapshot, StoreCallError> {
        self.products
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreCallError::permanent("product not found"))
    }

    async fn fetch_article(&self, id: &str) -> Result<ArticleSnapshot, StoreCallError> {
        self.articles
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreCallError::permanent("article not found"))
    }

    async fn fetch_images(&self, product_id: &str) -> Result<Vec<MediaImage>, StoreCallError> {
        Ok(self.fetch_product(product_id).await?.media)
    }

    async fn fetch_product_seo_batch(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, LiveSeo>, StoreCallError> {
        let products = self.products.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| products.get(id).map(|p| (id.clone(), p.seo.clone())))
            .collect())
    }

    async fn fetch_article_seo_batch(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, LiveSeo>, StoreCallError> {
        let articles = self.articles.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| articles.get(id).map(|a| (id.clone(), a.seo.clone())))
            .collect())
    }

    async fn write_product_seo(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
        _flags: SeoFlags,
        _observer: &dyn CallObserver,
    ) -> Result<(), StoreCallError> {
        if let Some(err) = self.failure_for(id) {
            return Err(err);
        }
        self.writes.lock().unwrap().push(WriteRecord::ProductSeo {
            id: id.to_string(),
            title: title.map(String::from),
            description: description.map(String::from),
        });
        Ok(())
    }

    async fn write_article_seo(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
        _flags: SeoFlags,
        _observer: &dyn CallObserver,
    ) -> Result<(), StoreCallError> {
        if let Some(err) = self.failure_for(id) {
            return Err(err);
        }
        self.writes.lock().unwrap().push(WriteRecord::ArticleSeo {
            id: id.to_string(),
            title: title.map(String::from),
            description: description.map(String::from),
        });
        Ok(())
    }

    async fn write_image_alt(
        &self,
        product_id: &str,
        media_id: &str,
        alt: &str,
        _observer: &dyn CallObserver,
    ) -> Result<(), StoreCallError> {
        if let Some(err) = self.failure_for(media_id) {
            return Err(err);
        }
        self.writes.lock().unwrap().push(WriteRecord::ImageAlt {
            product_id: product_id.to_string(),
            media_id: media_id.to_string(),
            alt: alt.to_string(),
        });
        Ok(())
    }
}

pub struct MockStoreApiFactory {
    api: Arc<MockStoreApi>,
}

impl StoreApiFactory for MockStoreApiFactory {
    fn open(&self, _endpoint: &str, _token: &str) -> Arc<dyn StoreApi> {
        self.api.clone()
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub usage: Arc<MemoryUsageLedger>,
    pub locks: Arc<MemoryTenantLocks>,
    pub broker: Arc<MemoryBroker>,
    pub tenants: Arc<MemoryTenantDirectory>,
    pub generator: Arc<ScriptedGenerator>,
    pub store_api: Arc<MockStoreApi>,
    pub kernel: Arc<EngineKernel>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new() -> Self {
        let settings = EngineSettings::default();
        let store = Arc::new(MemoryJobStore::new());
        let usage = Arc::new(MemoryUsageLedger::new(settings.free_time_zone));
        let locks = Arc::new(MemoryTenantLocks::new());
        let broker = Arc::new(MemoryBroker::new());
        let tenants = Arc::new(MemoryTenantDirectory::new());
        let generator = Arc::new(ScriptedGenerator::new());
        let store_api = Arc::new(MockStoreApi::default());

        let kernel = Arc::new(EngineKernel {
            store: store.clone(),
            usage: usage.clone(),
            locks: locks.clone(),
            broker: broker.clone(),
            tenants: tenants.clone(),
            generator: Arc::new(Generator::new(
                generator.clone(),
                GeneratorConfig::default(),
            )),
            store_apis: Arc::new(MockStoreApiFactory {
                api: store_api.clone(),
            }),
            settings,
            worker_id: EngineKernel::worker_id(),
        });

        let dispatcher = Dispatcher::new(kernel.clone());

        Self {
            store,
            usage,
            locks,
            broker,
            tenants,
            generator,
            store_api,
            kernel,
            dispatcher,
        }
    }

    pub fn producer(&self) -> Producer {
        Producer::new(self.kernel.clone())
    }

    pub fn register_tenant(&self, tenant: &str, plan: Plan) {
        self.tenants.insert(engine_core::kernel::TenantRecord {
            tenant: tenant.to_string(),
            api_endpoint: format!("https://{tenant}.example.com/admin/api/graphql"),
            api_token: "test-token".into(),
            plan,
        });
    }

    /// Seed a product in the mock store and return its GID.
    pub fn seed_product(&self, n: u64, title: &str) -> String {
        let id = format!("gid://store/Product/{n}");
        self.store_api.add_product(ProductSnapshot {
            id: id.clone(),
            title: title.to_string(),
            description_html: format!("<p>{title} description</p>"),
            seo: LiveSeo::default(),
            media: Vec::new(),
        });
        id
    }

    /// Seed a product carrying one image with an existing alt text.
    pub fn seed_product_with_image(&self, n: u64, title: &str, media_id: &str, alt: &str) -> String {
        let id = format!("gid://store/Product/{n}");
        self.store_api.add_product(ProductSnapshot {
            id: id.clone(),
            title: title.to_string(),
            description_html: String::new(),
            seo: LiveSeo::default(),
            media: vec![MediaImage {
                id: media_id.to_string(),
                alt: Some(alt.to_string()),
                url: Some(format!("https://cdn.example.com/{n}.jpg")),
            }],
        });
        id
    }

    pub fn product_spec(target_id: &str) -> ItemSpec {
        ItemSpec::builder()
            .target_type(TargetType::Product)
            .target_id(target_id)
            .build()
    }

    pub fn job_spec(tenant: &str, job_type: JobType) -> JobSpec {
        JobSpec::builder().tenant(tenant).job_type(job_type).build()
    }

    /// Create a product-SEO job and enqueue its generate pass.
    pub async fn create_product_job(&self, tenant: &str, product_ids: &[String]) -> Job {
        let items = product_ids
            .iter()
            .map(|id| Self::product_spec(id))
            .collect();
        self.producer()
            .create_job(Self::job_spec(tenant, JobType::ProductSeo), items)
            .await
            .unwrap()
    }

    /// Drive the broker until no ready messages remain.
    pub async fn pump(&self) -> usize {
        self.broker.pump_until_idle(&self.dispatcher).await
    }

    pub async fn job(&self, job_id: &str) -> Job {
        self.store.get_job(job_id).await.unwrap().unwrap()
    }

    pub async fn items(&self, job_id: &str) -> Vec<JobItem> {
        let mut items = self.store.items_for_job(job_id).await.unwrap();
        items.sort_by_key(|i| i.id);
        items
    }
}

/// The counter invariants that must hold after every run.
pub fn assert_counter_invariants(job: &Job, items: &[JobItem]) {
    assert!(
        job.ok_count + job.failed_count <= job.total,
        "ok {} + failed {} > total {}",
        job.ok_count,
        job.failed_count,
        job.total
    );
    let publish_settled = items
        .iter()
        .filter(|i| {
            matches!(
                i.publish_status,
                engine_core::kernel::PublishStatus::Success
                    | engine_core::kernel::PublishStatus::Failed
            )
        })
        .count() as i32;
    assert!(
        job.publish_ok_count + job.publish_failed_count <= publish_settled,
        "publish counters exceed settled items"
    );
}
