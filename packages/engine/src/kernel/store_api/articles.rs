//! Blog article reads and SEO writes.
//!
//! Article SEO lives only in the `global/title_tag` and
//! `global/description_tag` metafields; there is no native pair, so the
//! backfill rule never fires here. Owner ids always use the `Article` GID
//! form; when the store rejects it with "Invalid id" the numeric tail is
//! re-normalized and tried once more.

use std::collections::HashMap;

use serde::Deserialize;

use super::products::{live_seo, MetafieldValue};
use super::types::{ArticleSnapshot, LiveSeo, SeoFlags};
use super::{StoreApiClient, StoreCallError};
use crate::common::gid;
use crate::kernel::store_api::products::stage_seo_writes;
use crate::kernel::telemetry::CallObserver;

const ARTICLE_QUERY: &str = r#"
query Article($id: ID!) {
  article(id: $id) {
    id
    title
    body
    metaTitle: metafield(namespace: "global", key: "title_tag") { value }
    metaDescription: metafield(namespace: "global", key: "description_tag") { value }
  }
}
"#;

const ARTICLE_SEO_BATCH_QUERY: &str = r#"
query ArticleSeoBatch($ids: [ID!]!) {
  nodes(ids: $ids) {
    ... on Article {
      id
      metaTitle: metafield(namespace: "global", key: "title_tag") { value }
      metaDescription: metafield(namespace: "global", key: "description_tag") { value }
    }
  }
}
"#;

#[derive(Deserialize)]
struct ArticleData {
    article: Option<ArticleNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArticleNode {
    id: String,
    title: Option<String>,
    body: Option<String>,
    meta_title: Option<MetafieldValue>,
    meta_description: Option<MetafieldValue>,
}

#[derive(Deserialize)]
struct BatchData {
    nodes: Vec<Option<BatchNode>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchNode {
    id: Option<String>,
    meta_title: Option<MetafieldValue>,
    meta_description: Option<MetafieldValue>,
}

fn article_live_seo(
    meta_title: Option<MetafieldValue>,
    meta_description: Option<MetafieldValue>,
) -> LiveSeo {
    live_seo(None, meta_title, meta_description)
}

impl StoreApiClient {
    pub(crate) async fn fetch_article_impl(
        &self,
        id: &str,
        observer: &dyn CallObserver,
    ) -> Result<ArticleSnapshot, StoreCallError> {
        let id = gid::normalize("Article", id);
        let data = self
            .call(
                "fetch_article",
                ARTICLE_QUERY,
                serde_json::json!({ "id": id }),
                observer,
            )
            .await?;
        let decoded: ArticleData = Self::decode(data, "article")?;
        let node = decoded
            .article
            .ok_or_else(|| StoreCallError::permanent("article not found"))?;
        Ok(ArticleSnapshot {
            id: node.id,
            title: node.title.unwrap_or_default(),
            body: node.body.unwrap_or_default(),
            seo: article_live_seo(node.meta_title, node.meta_description),
        })
    }

    pub(crate) async fn fetch_article_seo_batch_impl(
        &self,
        ids: &[String],
        observer: &dyn CallObserver,
    ) -> Result<HashMap<String, LiveSeo>, StoreCallError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids: Vec<String> = ids.iter().map(|id| gid::normalize("Article", id)).collect();
        let data = self
            .call(
                "fetch_article_seo_batch",
                ARTICLE_SEO_BATCH_QUERY,
                serde_json::json!({ "ids": ids }),
                observer,
            )
            .await?;
        let decoded: BatchData = Self::decode(data, "article batch")?;
        Ok(decoded
            .nodes
            .into_iter()
            .flatten()
            .filter_map(|node| {
                node.id
                    .map(|id| (id, article_live_seo(node.meta_title, node.meta_description)))
            })
            .collect())
    }

    pub(crate) async fn write_article_seo_impl(
        &self,
        id: &str,
        title: Option<&str>,
        description: Option<&str>,
        flags: SeoFlags,
        observer: &dyn CallObserver,
    ) -> Result<(), StoreCallError> {
        let owner = gid::normalize("Article", id);
        let snapshot = self.fetch_article_impl(&owner, observer).await?;
        let writes = stage_seo_writes(title, description, flags, &snapshot.seo);
        if writes.is_empty() {
            tracing::debug!(article_id = %owner, "nothing to write, skipping mutation");
            return Ok(());
        }

        match self.write_metafields(&owner, writes.clone(), observer).await {
            Err(err) if err.permanent && err.user_message.contains("Invalid id") => {
                // Some stores only accept the freshly re-normalized form.
                let renormalized = gid::numeric_tail(&owner)
                    .map(|n| format!("gid://store/Article/{n}"))
                    .filter(|candidate| candidate != &owner);
                match renormalized {
                    Some(candidate) => {
                        tracing::info!(article_id = %owner, retry_id = %candidate, "retrying write with normalized article id");
                        self.write_metafields(&candidate, writes, observer).await
                    }
                    None => Err(err),
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::transport_mock::ScriptedTransport;
    use super::super::{StoreApiConfig, StoreCallError};
    use super::*;
    use crate::kernel::telemetry::recording::RecordingObserver;

    fn client(transport: std::sync::Arc<ScriptedTransport>) -> StoreApiClient {
        StoreApiClient::new(transport, StoreApiConfig::default())
    }

    const ARTICLE_BODY: &str = r#"{
        "data": {
            "article": {
                "id": "gid://store/Article/7",
                "title": "Hello",
                "body": "World",
                "metaTitle": {"value": "Old title"},
                "metaDescription": null
            }
        }
    }"#;

    #[tokio::test]
    async fn fetch_article_reads_metafield_seo() {
        let transport = ScriptedTransport::new(vec![ScriptedTransport::ok(ARTICLE_BODY)]);
        let article = client(transport)
            .fetch_article_impl("7", &RecordingObserver::new())
            .await
            .unwrap();
        assert_eq!(article.id, "gid://store/Article/7");
        assert_eq!(article.seo.meta_title.as_deref(), Some("Old title"));
        assert!(article.seo.native_title.is_none());
    }

    #[tokio::test]
    async fn wrongly_typed_gids_are_normalized_before_the_first_write() {
        let set_ok = r#"{"data": {"metafieldsSet": {"metafields": [], "userErrors": []}}}"#;
        let transport = ScriptedTransport::new(vec![
            ScriptedTransport::ok(ARTICLE_BODY),
            ScriptedTransport::ok(set_ok),
        ]);
        // The alternate typename never reaches the wire: the owner id is
        // canonicalized up front.
        client(transport.clone())
            .write_article_seo_impl(
                "gid://store/OnlineStoreArticle/7",
                Some("T"),
                Some("D"),
                SeoFlags {
                    title: true,
                    description: true,
                },
                &RecordingObserver::new(),
            )
            .await
            .unwrap();
        let queries = transport.queries.lock().unwrap();
        let mutation_vars = &queries[1].1;
        let owner = mutation_vars["metafields"][0]["ownerId"].as_str().unwrap();
        assert_eq!(owner, "gid://store/Article/7");
    }

    #[tokio::test]
    async fn invalid_id_without_a_different_candidate_does_not_re_mutate() {
        let invalid = r#"{"errors": [{"message": "Invalid id"}]}"#;
        let transport = ScriptedTransport::new(vec![
            ScriptedTransport::ok(ARTICLE_BODY),
            ScriptedTransport::ok(invalid),
        ]);
        let err = client(transport.clone())
            .write_article_seo_impl(
                "7",
                Some("T"),
                Some("D"),
                SeoFlags {
                    title: true,
                    description: true,
                },
                &RecordingObserver::new(),
            )
            .await
            .unwrap_err();
        assert!(err.user_message.contains("Invalid id"));
        // The id was already canonical, so no second blind mutation goes out.
        assert_eq!(transport.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn write_skips_mutation_when_nothing_staged() {
        let transport = ScriptedTransport::new(vec![ScriptedTransport::ok(ARTICLE_BODY)]);
        client(transport.clone())
            .write_article_seo_impl(
                "7",
                None,
                Some("   "),
                SeoFlags {
                    title: true,
                    description: true,
                },
                &RecordingObserver::new(),
            )
            .await
            .unwrap();
        // Only the read went out.
        assert_eq!(transport.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn permanent_invalid_id_without_alternate_form_propagates() {
        let err = StoreCallError::permanent("Invalid id");
        assert!(err.permanent);
        assert!(err.user_message.contains("Invalid id"));
    }
}
