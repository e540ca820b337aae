//! Product reads and SEO writes.
//!
//! SEO is written through `metafieldsSet`, never through the native
//! `seo { … }` field, so a store owner's manual edits are not clobbered.
//! Staging is a pure decision over the draft, the job's field flags, and
//! the live state; see [`stage_seo_writes`].

use std::collections::HashMap;

use serde::Deserialize;

use super::types::{
    LiveSeo, MediaImage, MetafieldWrite, ProductSnapshot, SeoFlags, DESCRIPTION_TAG,
    SEO_NAMESPACE, TEXT_FIELD_TYPE, TITLE_TAG,
};
use super::{StoreApiClient, StoreCallError};
use crate::kernel::telemetry::CallObserver;

const PRODUCT_QUERY: &str = r#"
query Product($id: ID!) {
  product(id: $id) {
    id
    title
    descriptionHtml
    seo { title description }
    metaTitle: metafield(namespace: "global", key: "title_tag") { value }
    metaDescription: metafield(namespace: "global", key: "description_tag") { value }
    media(first: 100) {
      nodes {
        ... on MediaImage {
          id
          alt
          image { url }
        }
      }
    }
  }
}
"#;

const PRODUCT_SEO_BATCH_QUERY: &str = r#"
query ProductSeoBatch($ids: [ID!]!) {
  nodes(ids: $ids) {
    ... on Product {
      id
      seo { title description }
      metaTitle: metafield(namespace: "global", key: "title_tag") { value }
      metaDescription: metafield(namespace: "global", key: "description_tag") { value }
    }
  }
}
"#;

const METAFIELDS_SET_MUTATION: &str = r#"
mutation SetSeoMetafields($metafields: [MetafieldsSetInput!]!) {
  metafieldsSet(metafields: $metafields) {
    metafields { id }
    userErrors { field message }
  }
}
"#;

#[derive(Deserialize)]
struct ProductData {
    product: Option<ProductNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductNode {
    id: String,
    title: Option<String>,
    description_html: Option<String>,
    seo: Option<SeoNode>,
    meta_title: Option<MetafieldValue>,
    meta_description: Option<MetafieldValue>,
    media: Option<MediaConnection>,
}

#[derive(Deserialize)]
pub(crate) struct SeoNode {
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct MetafieldValue {
    pub value: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct MediaConnection {
    pub nodes: Vec<MediaNode>,
}

#[derive(Deserialize, Default)]
pub(crate) struct MediaNode {
    pub id: Option<String>,
    pub alt: Option<String>,
    pub image: Option<ImageNode>,
}

#[derive(Deserialize)]
pub(crate) struct ImageNode {
    pub url: Option<String>,
}

#[derive(Deserialize)]
struct BatchData {
    nodes: Vec<Option<BatchNode>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchNode {
    id: Option<String>,
    seo: Option<SeoNode>,
    meta_title: Option<MetafieldValue>,
    meta_description: Option<MetafieldValue>,
}

#[derive(Deserialize)]
struct MetafieldsSetData {
    #[serde(rename = "metafieldsSet")]
    metafields_set: Option<UserErrorEnvelope>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserErrorEnvelope {
    user_errors: Option<Vec<UserError>>,
}

#[derive(Deserialize)]
struct UserError {
    message: String,
}

pub(crate) fn live_seo(
    seo: Option<SeoNode>,
    meta_title: Option<MetafieldValue>,
    meta_description: Option<MetafieldValue>,
) -> LiveSeo {
    let (native_title, native_description) = match seo {
        Some(seo) => (seo.title, seo.description),
        None => (None, None),
    };
    LiveSeo {
        native_title,
        native_description,
        meta_title: meta_title.and_then(|m| m.value),
        meta_description: meta_description.and_then(|m| m.value),
    }
}

pub(crate) fn media_images(media: Option<MediaConnection>) -> Vec<MediaImage> {
    media
        .map(|m| m.nodes)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|node| {
            node.id.map(|id| MediaImage {
                id,
                alt: node.alt,
                url: node.image.and_then(|i| i.url),
            })
        })
        .collect()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Decide which metafields to write for one entity.
///
/// A field is staged when the job is configured to write it and its draft is
/// non-empty after trimming. When exactly one side is staged, the other side
/// is configured, its metafield is empty, and a live value exists in the
/// native `seo { … }` pair, the native value is copied over too — otherwise
/// that side goes invisible once the storefront reads SEO from metafields.
/// Empty strings are never written; they would clear a live value.
pub fn stage_seo_writes(
    draft_title: Option<&str>,
    draft_description: Option<&str>,
    flags: SeoFlags,
    live: &LiveSeo,
) -> Vec<MetafieldWrite> {
    let title = flags.title.then(|| non_empty(draft_title)).flatten();
    let description = flags
        .description
        .then(|| non_empty(draft_description))
        .flatten();

    let mut writes = Vec::new();
    if let Some(value) = title {
        writes.push(MetafieldWrite {
            key: TITLE_TAG,
            value: value.to_string(),
        });
    }
    if let Some(value) = description {
        writes.push(MetafieldWrite {
            key: DESCRIPTION_TAG,
            value: value.to_string(),
        });
    }

    if title.is_some() && description.is_none() && flags.description {
        if non_empty(live.meta_description.as_deref()).is_none() {
            if let Some(native) = non_empty(live.native_description.as_deref()) {
                writes.push(MetafieldWrite {
                    key: DESCRIPTION_TAG,
                    value: native.to_string(),
                });
            }
        }
    }
    if description.is_some() && title.is_none() && flags.title {
        if non_empty(live.meta_title.as_deref()).is_none() {
            if let Some(native) = non_empty(live.native_title.as_deref()) {
                writes.push(MetafieldWrite {
                    key: TITLE_TAG,
                    value: native.to_string(),
                });
            }
        }
    }

    writes
}

impl StoreApiClient {
    pub(crate) async fn fetch_product_impl(
        &self,
        id: &str,
        observer: &dyn CallObserver,
    ) -> Result<ProductSnapshot, StoreCallError> {
        let id = crate::common::gid::normalize("Product", id);
        let data = self
            .call(
                "fetch_product",
                PRODUCT_QUERY,
                serde_json::json!({ "id": id }),
                observer,
            )
            .await?;
        let decoded: ProductData = Self::decode(data, "product")?;
        let node = decoded
            .product
            .ok_or_else(|| StoreCallError::permanent("product not found"))?;
        Ok(ProductSnapshot {
            id: node.id,
            title: node.title.unwrap_or_default(),
            description_html: node.description_html.unwrap_or_default(),
            seo: live_seo(node.seo, node.meta_title, node.meta_description),
            media: media_images(node.media),
        })
    }

    pub(crate) async fn fetch_product_seo_batch_impl(
        &self,
        ids: &[String],
        observer: &dyn CallObserver,
    ) -> Result<HashMap<String, LiveSeo>, StoreCallError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids: Vec<String> = ids
            .iter()
            .map(|id| crate::common::gid::normalize("Product", id))
            .collect();
        let data = self
            .call(
                "fetch_product_seo_batch",
                PRODUCT_SEO_BATCH_QUERY,
                serde_json::json!({ "ids": ids }),
                observer,
            )
            .await?;
        let decoded: BatchData = Self::decode(data, "product batch")?;
        Ok(decoded
            .nodes
            .into_iter()
            .flatten()
            .filter_map(|node| {
                node.id.map(|id| {
                    (
                        id,
                        live_seo(node.seo, node.meta_title, node.meta_description),
                    )
                })
            })
            .collect())
    }

    /// Shared metafield write path for products and articles.
    pub(crate) async fn write_metafields(
        &self,
        owner_id: &str,
        writes: Vec<MetafieldWrite>,
        observer: &dyn CallObserver,
    ) -> Result<(), StoreCallError> {
        let metafields: Vec<serde_json::Value> = writes
            .iter()
            .map(|w| {
                serde_json::json!({
                    "ownerId": owner_id,
                    "namespace": SEO_NAMESPACE,
                    "key": w.key,
                    "type": TEXT_FIELD_TYPE,
                    "value": w.value,
                })
            })
            .collect();

        let data = self
            .call(
                "metafields_set",
                METAFIELDS_SET_MUTATION,
                serde_json::json!({ "metafields": metafields }),
                observer,
            )
            .await?;
        let decoded: MetafieldsSetData = Self::decode(data, "metafieldsSet")?;
        let user_errors = decoded
            .metafields_set
            .and_then(|e| e.user_errors)
            .unwrap_or_default();
        if !user_errors.is_empty() {
            let joined = user_errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(StoreCallError::permanent(joined));
        }
        Ok(())
    }

    pub(crate) async fn write_product_seo_impl(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
        flags: SeoFlags,
        observer: &dyn CallObserver,
    ) -> Result<(), StoreCallError> {
        let snapshot = self.fetch_product_impl(id, observer).await?;
        let writes = stage_seo_writes(title, description, flags, &snapshot.seo);
        if writes.is_empty() {
            tracing::debug!(product_id = %snapshot.id, "nothing to write, skipping mutation");
            return Ok(());
        }
        self.write_metafields(&snapshot.id, writes, observer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTH: SeoFlags = SeoFlags {
        title: true,
        description: true,
    };

    fn keys(writes: &[MetafieldWrite]) -> Vec<&'static str> {
        writes.iter().map(|w| w.key).collect()
    }

    #[test]
    fn stages_both_fields_when_present() {
        let writes = stage_seo_writes(Some("T"), Some("D"), BOTH, &LiveSeo::default());
        assert_eq!(keys(&writes), vec![TITLE_TAG, DESCRIPTION_TAG]);
    }

    #[test]
    fn empty_or_whitespace_drafts_are_never_written() {
        let writes = stage_seo_writes(Some("  "), Some(""), BOTH, &LiveSeo::default());
        assert!(writes.is_empty());
    }

    #[test]
    fn disabled_fields_are_not_staged() {
        let flags = SeoFlags {
            title: true,
            description: false,
        };
        let writes = stage_seo_writes(Some("T"), Some("D"), flags, &LiveSeo::default());
        assert_eq!(keys(&writes), vec![TITLE_TAG]);
    }

    #[test]
    fn backfills_description_from_native_seo() {
        // Writing only the title while the description metafield is empty
        // but a native description exists: carry the native value over.
        let live = LiveSeo {
            native_description: Some("Existing description".into()),
            ..Default::default()
        };
        let writes = stage_seo_writes(Some("T"), None, BOTH, &live);
        assert_eq!(keys(&writes), vec![TITLE_TAG, DESCRIPTION_TAG]);
        assert_eq!(writes[1].value, "Existing description");
    }

    #[test]
    fn backfills_title_symmetrically() {
        let live = LiveSeo {
            native_title: Some("Existing title".into()),
            ..Default::default()
        };
        let writes = stage_seo_writes(None, Some("D"), BOTH, &live);
        assert_eq!(keys(&writes), vec![DESCRIPTION_TAG, TITLE_TAG]);
        assert_eq!(writes[1].value, "Existing title");
    }

    #[test]
    fn no_backfill_when_the_metafield_already_has_a_value() {
        let live = LiveSeo {
            native_description: Some("Native".into()),
            meta_description: Some("Already set".into()),
            ..Default::default()
        };
        let writes = stage_seo_writes(Some("T"), None, BOTH, &live);
        assert_eq!(keys(&writes), vec![TITLE_TAG]);
    }

    #[test]
    fn no_backfill_when_the_other_side_is_not_configured() {
        let flags = SeoFlags {
            title: true,
            description: false,
        };
        let live = LiveSeo {
            native_description: Some("Native".into()),
            ..Default::default()
        };
        let writes = stage_seo_writes(Some("T"), None, flags, &live);
        assert_eq!(keys(&writes), vec![TITLE_TAG]);
    }

    #[test]
    fn media_nodes_without_ids_are_dropped() {
        // Non-image media decode to empty objects through the inline
        // fragment.
        let media = MediaConnection {
            nodes: vec![
                MediaNode {
                    id: Some("gid://store/MediaImage/1".into()),
                    alt: Some("a bike".into()),
                    image: Some(ImageNode {
                        url: Some("https://cdn/x.jpg".into()),
                    }),
                },
                MediaNode::default(),
            ],
        };
        let images = media_images(Some(media));
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].alt.as_deref(), Some("a bike"));
    }
}
