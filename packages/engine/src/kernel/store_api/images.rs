//! Product image reads and alt-text writes.

use serde::Deserialize;

use super::products::{media_images, MediaConnection};
use super::types::MediaImage;
use super::{StoreApiClient, StoreCallError};
use crate::common::gid;
use crate::kernel::telemetry::CallObserver;

const PRODUCT_IMAGES_QUERY: &str = r#"
query ProductImages($id: ID!) {
  product(id: $id) {
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

const UPDATE_MEDIA_MUTATION: &str = r#"
mutation UpdateMediaAlt($productId: ID!, $media: [UpdateMediaInput!]!) {
  productUpdateMedia(productId: $productId, media: $media) {
    media {
      ... on MediaImage { id alt }
    }
    mediaUserErrors { message }
  }
}
"#;

#[derive(Deserialize)]
struct ImagesData {
    product: Option<ImagesNode>,
}

#[derive(Deserialize)]
struct ImagesNode {
    media: Option<MediaConnection>,
}

#[derive(Deserialize)]
struct UpdateMediaData {
    #[serde(rename = "productUpdateMedia")]
    product_update_media: Option<UpdateMediaEnvelope>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateMediaEnvelope {
    media_user_errors: Option<Vec<MediaUserError>>,
}

#[derive(Deserialize)]
struct MediaUserError {
    message: String,
}

impl StoreApiClient {
    pub(crate) async fn fetch_images_impl(
        &self,
        product_id: &str,
        observer: &dyn CallObserver,
    ) -> Result<Vec<MediaImage>, StoreCallError> {
        let id = gid::normalize("Product", product_id);
        let data = self
            .call(
                "fetch_images",
                PRODUCT_IMAGES_QUERY,
                serde_json::json!({ "id": id }),
                observer,
            )
            .await?;
        let decoded: ImagesData = Self::decode(data, "product images")?;
        let node = decoded
            .product
            .ok_or_else(|| StoreCallError::permanent("product not found"))?;
        Ok(media_images(node.media))
    }

    pub(crate) async fn write_image_alt_impl(
        &self,
        product_id: &str,
        media_id: &str,
        alt: &str,
        observer: &dyn CallObserver,
    ) -> Result<(), StoreCallError> {
        let product_id = gid::normalize("Product", product_id);
        let data = self
            .call(
                "write_image_alt",
                UPDATE_MEDIA_MUTATION,
                serde_json::json!({
                    "productId": product_id,
                    "media": [{ "id": media_id, "alt": alt }],
                }),
                observer,
            )
            .await?;
        let decoded: UpdateMediaData = Self::decode(data, "productUpdateMedia")?;
        let errors = decoded
            .product_update_media
            .and_then(|e| e.media_user_errors)
            .unwrap_or_default();
        if !errors.is_empty() {
            let joined = errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(StoreCallError::permanent(joined));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::transport_mock::ScriptedTransport;
    use super::super::StoreApiConfig;
    use super::*;
    use crate::kernel::telemetry::recording::RecordingObserver;

    fn client(transport: std::sync::Arc<ScriptedTransport>) -> StoreApiClient {
        StoreApiClient::new(transport, StoreApiConfig::default())
    }

    #[tokio::test]
    async fn write_image_alt_surfaces_media_user_errors() {
        let body = r#"{
            "data": {"productUpdateMedia": {"media": [], "mediaUserErrors": [{"message": "Media not found"}]}}
        }"#;
        let transport = ScriptedTransport::new(vec![ScriptedTransport::ok(body)]);
        let err = client(transport)
            .write_image_alt_impl(
                "1",
                "gid://store/MediaImage/9",
                "a red bicycle",
                &RecordingObserver::new(),
            )
            .await
            .unwrap_err();
        assert!(err.permanent);
        assert!(err.user_message.contains("Media not found"));
    }

    #[tokio::test]
    async fn write_image_alt_sends_the_media_payload() {
        let body = r#"{"data": {"productUpdateMedia": {"media": [], "mediaUserErrors": []}}}"#;
        let transport = ScriptedTransport::new(vec![ScriptedTransport::ok(body)]);
        client(transport.clone())
            .write_image_alt_impl(
                "42",
                "gid://store/MediaImage/9",
                "studio shot",
                &RecordingObserver::new(),
            )
            .await
            .unwrap();
        let queries = transport.queries.lock().unwrap();
        let vars = &queries[0].1;
        assert_eq!(vars["productId"], "gid://store/Product/42");
        assert_eq!(vars["media"][0]["alt"], "studio shot");
    }

    #[tokio::test]
    async fn fetch_images_returns_media_nodes() {
        let body = r#"{
            "data": {"product": {"media": {"nodes": [
                {"id": "gid://store/MediaImage/1", "alt": "old alt", "image": {"url": "https://cdn/a.jpg"}},
                {}
            ]}}}
        }"#;
        let transport = ScriptedTransport::new(vec![ScriptedTransport::ok(body)]);
        let images = client(transport)
            .fetch_images_impl("1", &RecordingObserver::new())
            .await
            .unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id, "gid://store/MediaImage/1");
    }
}
