//! Content-addressed document retrieval through mirror gateways
//!
//! `ipfs://<cid>/<path>` URIs are expanded against each configured gateway
//! and tried in order; plain `http(s)` URIs are fetched directly. Every
//! attempt is bounded by the fetch timeout.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use super::DetailError;
use crate::types::ItemDetail;

/// ERC-721 style metadata document for a card.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CardDocument {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub rating: Option<u32>,
    #[serde(default)]
    pub attributes: Vec<DocumentAttribute>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentAttribute {
    pub trait_type: String,
    pub value: serde_json::Value,
}

impl CardDocument {
    fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes
            .iter()
            .find(|a| a.trait_type.eq_ignore_ascii_case(name))
            .map(|a| &a.value)
    }

    fn text_attribute(&self, name: &str) -> Option<String> {
        self.attribute(name)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    /// Overlay document fields onto a detail built from chain data.
    pub fn apply_to(&self, detail: &mut ItemDetail, gateway: &GatewayFetcher) {
        if let Some(name) = &self.name {
            detail.player_name = name.clone();
        }
        if let Some(position) = self.position.clone().or_else(|| self.text_attribute("position")) {
            detail.position = position;
        }
        if let Some(team) = self.team.clone().or_else(|| self.text_attribute("team")) {
            detail.team = team;
        }
        let rating = self.rating.or_else(|| {
            self.attribute("rating")
                .and_then(|v| v.as_u64())
                .and_then(|r| u32::try_from(r).ok())
        });
        if let Some(rating) = rating {
            detail.rating = rating;
        }
        if let Some(image) = &self.image {
            detail.image_url = gateway
                .resolve_urls(image)
                .into_iter()
                .next()
                .unwrap_or_else(|| image.clone());
        }
    }
}

/// Fetches documents from an ordered list of gateways.
pub struct GatewayFetcher {
    http_client: reqwest::Client,
    gateways: Vec<String>,
    timeout: Duration,
}

impl GatewayFetcher {
    pub fn new(gateways: Vec<String>, timeout: Duration) -> Result<Self, DetailError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("collection-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DetailError::Gateway(format!("building HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            gateways: gateways
                .into_iter()
                .map(|g| g.trim_end_matches('/').to_string())
                .filter(|g| !g.is_empty())
                .collect(),
            timeout,
        })
    }

    pub fn gateways(&self) -> &[String] {
        &self.gateways
    }

    /// Candidate HTTP URLs for a URI, in the order they should be tried.
    pub fn resolve_urls(&self, uri: &str) -> Vec<String> {
        if let Some(rest) = uri.strip_prefix("ipfs://") {
            let path = rest.strip_prefix("ipfs/").unwrap_or(rest);
            if path.is_empty() {
                return vec![];
            }
            return self
                .gateways
                .iter()
                .map(|g| format!("{}/ipfs/{}", g, path))
                .collect();
        }
        if uri.starts_with("https://") || uri.starts_with("http://") {
            return vec![uri.to_string()];
        }
        vec![]
    }

    /// Fetch and parse a JSON document, trying each mirror in turn.
    pub async fn fetch_json<T: DeserializeOwned>(&self, uri: &str) -> Result<T, DetailError> {
        let urls = self.resolve_urls(uri);
        if urls.is_empty() {
            if uri.starts_with("ipfs://") {
                return Err(DetailError::NoGateways);
            }
            return Err(DetailError::UnsupportedUri(uri.to_string()));
        }

        let mut last_error = None;
        for url in &urls {
            let attempt = tokio::time::timeout(self.timeout, self.fetch_one::<T>(url)).await;
            match attempt {
                Ok(Ok(doc)) => {
                    debug!(url = %url, "Fetched metadata document");
                    return Ok(doc);
                }
                Ok(Err(e)) => {
                    warn!(url = %url, error = %e, "Gateway fetch failed, trying next mirror");
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(url = %url, "Gateway fetch timed out, trying next mirror");
                    last_error = Some(DetailError::Timeout(url.clone()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| DetailError::Gateway(format!("all mirrors failed for {}", uri))))
    }

    async fn fetch_one<T: DeserializeOwned>(&self, url: &str) -> Result<T, DetailError> {
        let response = self.http_client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                DetailError::Timeout(url.to_string())
            } else {
                DetailError::Gateway(format!("Request failed: {}", e))
            }
        })?;

        if !response.status().is_success() {
            return Err(DetailError::Gateway(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| DetailError::Gateway(format!("Body decode failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rarity;

    fn fetcher() -> GatewayFetcher {
        GatewayFetcher::new(
            vec!["https://ipfs.io/".into(), "https://gateway.pinata.cloud".into()],
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_ipfs_uri_expands_per_gateway() {
        let urls = fetcher().resolve_urls("ipfs://bafyabc/cards/7.json");
        assert_eq!(
            urls,
            vec![
                "https://ipfs.io/ipfs/bafyabc/cards/7.json".to_string(),
                "https://gateway.pinata.cloud/ipfs/bafyabc/cards/7.json".to_string(),
            ]
        );
    }

    #[test]
    fn test_ipfs_ipfs_prefix_is_normalized() {
        let urls = fetcher().resolve_urls("ipfs://ipfs/bafyabc");
        assert_eq!(urls[0], "https://ipfs.io/ipfs/bafyabc");
    }

    #[test]
    fn test_http_uri_is_used_directly() {
        let urls = fetcher().resolve_urls("https://cards.example/7.json");
        assert_eq!(urls, vec!["https://cards.example/7.json".to_string()]);
        assert!(fetcher().resolve_urls("ar://abc").is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_uri() {
        let result: Result<CardDocument, _> = fetcher().fetch_json("ar://abc").await;
        assert!(matches!(result, Err(DetailError::UnsupportedUri(_))));
    }

    #[tokio::test]
    async fn test_ipfs_without_gateways() {
        let empty = GatewayFetcher::new(vec![], Duration::from_secs(1)).unwrap();
        let result: Result<CardDocument, _> = empty.fetch_json("ipfs://bafyabc").await;
        assert!(matches!(result, Err(DetailError::NoGateways)));
    }

    #[test]
    fn test_document_overlay() {
        let doc: CardDocument = serde_json::from_str(
            r#"{
                "name": "Justin Jefferson",
                "image": "ipfs://bafyimg/9.png",
                "attributes": [
                    {"trait_type": "Position", "value": "WR"},
                    {"trait_type": "Team", "value": "Minnesota Vikings"},
                    {"trait_type": "Rating", "value": 97}
                ]
            }"#,
        )
        .unwrap();

        let mut detail = ItemDetail {
            player_id: "9".into(),
            player_name: "Player #9".into(),
            position: "Unknown".into(),
            team: "Unknown".into(),
            rarity: Rarity::Epic,
            image_url: String::new(),
            rating: 70,
            mint_timestamp: 0,
            metadata_uri: "ipfs://bafymeta/9.json".into(),
        };
        doc.apply_to(&mut detail, &fetcher());

        assert_eq!(detail.player_name, "Justin Jefferson");
        assert_eq!(detail.position, "WR");
        assert_eq!(detail.team, "Minnesota Vikings");
        assert_eq!(detail.rating, 97);
        assert_eq!(detail.image_url, "https://ipfs.io/ipfs/bafyimg/9.png");
        assert_eq!(detail.rarity, Rarity::Epic);
    }
}
