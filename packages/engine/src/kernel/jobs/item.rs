//! Item model: one unit of work inside a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use super::job::JobType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "target_type", rename_all = "snake_case")]
pub enum TargetType {
    Product,
    Image,
    Article,
}

/// Generate-phase state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "item_status", rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Queued,
    Running,
    Success,
    Failed,
}

/// Publish-phase state. `Skipped` marks items the user deselected (or that
/// had no visible change when `apply_only_changed` pruning ran).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "publish_status", rename_all = "snake_case")]
pub enum PublishStatus {
    #[default]
    Queued,
    Running,
    Success,
    Failed,
    Skipped,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct JobItem {
    pub id: i64,
    pub job_id: String,

    pub target_type: TargetType,
    /// Canonical GID of the target entity.
    pub target_id: String,
    /// Product id for images; null for products and articles.
    pub parent_id: Option<String>,
    pub title: Option<String>,
    pub media_id: Option<String>,
    pub image_url: Option<String>,

    // Generate state
    pub status: ItemStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub gen_attempts: i32,
    pub gen_retry_wait_ms: i64,

    // Draft output. For images `seo_title` carries the draft alt text and
    // `seo_description` the current-live alt baseline.
    pub seo_title: Option<String>,
    pub seo_description: Option<String>,

    // Publish state
    pub publish_status: PublishStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub publish_error: Option<String>,
    pub publish_attempts: i32,
    pub publish_retry_wait_ms: i64,
}

/// Typed view over the shared draft columns, keyed by job type, so image
/// alt text is never read or written as if it were a product title.
#[derive(Debug, Clone, PartialEq)]
pub enum DraftView<'a> {
    Seo {
        title: Option<&'a str>,
        description: Option<&'a str>,
    },
    ImageAlt {
        alt: Option<&'a str>,
        live_alt: Option<&'a str>,
    },
}

impl JobItem {
    /// Interpret the draft columns for the given job type.
    pub fn draft(&self, job_type: JobType) -> DraftView<'_> {
        match job_type {
            JobType::ImageAlt => DraftView::ImageAlt {
                alt: self.seo_title.as_deref(),
                live_alt: self.seo_description.as_deref(),
            },
            JobType::ProductSeo | JobType::BlogSeo => DraftView::Seo {
                title: self.seo_title.as_deref(),
                description: self.seo_description.as_deref(),
            },
        }
    }
}

/// Draft values a phase persists on item success.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemDraft {
    Seo {
        title: Option<String>,
        description: Option<String>,
    },
    Alt {
        alt: String,
        /// Live alt observed at generation time; keeps the "edited" badge
        /// comparison meaningful.
        live_alt: Option<String>,
    },
}

/// Everything the producer supplies per item.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct ItemSpec {
    pub target_type: TargetType,
    pub target_id: String,
    #[builder(default)]
    pub parent_id: Option<String>,
    #[builder(default)]
    pub title: Option<String>,
    #[builder(default)]
    pub media_id: Option<String>,
    #[builder(default)]
    pub image_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_view_separates_image_semantics() {
        let mut item = crate::kernel::jobs::testing::item_fixture(1, "j1", TargetType::Image);
        item.seo_title = Some("a red bicycle".into());
        item.seo_description = Some("bike".into());

        match item.draft(JobType::ImageAlt) {
            DraftView::ImageAlt { alt, live_alt } => {
                assert_eq!(alt, Some("a red bicycle"));
                assert_eq!(live_alt, Some("bike"));
            }
            other => panic!("unexpected view: {other:?}"),
        }

        match item.draft(JobType::ProductSeo) {
            DraftView::Seo { title, .. } => assert_eq!(title, Some("a red bicycle")),
            other => panic!("unexpected view: {other:?}"),
        }
    }

    #[test]
    fn item_spec_builder_defaults_optionals() {
        let spec = ItemSpec::builder()
            .target_type(TargetType::Product)
            .target_id("gid://store/Product/1")
            .build();
        assert!(spec.parent_id.is_none());
        assert!(spec.media_id.is_none());
    }
}
