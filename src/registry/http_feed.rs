use crate::core::artifact::ArtifactInstance;
use crate::registry::{client::build_http_client, FeedSource, RemotePackageInfo};
use crate::{DepotError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};

/// A [`FeedSource`] over a JSON package index.
///
/// The index answers `GET {base_url}/packages/{name}/{version}/json` with a
/// [`RemotePackageInfo`] document, 404 for a package it does not have.
pub struct HttpFeed {
    client: Client,
    artifact_type: String,
    name: String,
    base_url: String,
}

impl HttpFeed {
    pub fn new(
        artifact_type: impl Into<String>,
        name: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self::with_client(build_http_client(), artifact_type, name, base_url)
    }

    pub fn with_client(
        client: Client,
        artifact_type: impl Into<String>,
        name: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            artifact_type: artifact_type.into(),
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn package_url(&self, instance: &ArtifactInstance) -> String {
        format!(
            "{}/packages/{}/{}/json",
            self.base_url,
            urlencoding::encode(instance.name()),
            urlencoding::encode(&instance.version().to_string())
        )
    }
}

#[async_trait]
impl FeedSource for HttpFeed {
    fn artifact_type(&self) -> &str {
        &self.artifact_type
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn get_package_info(
        &self,
        instance: &ArtifactInstance,
    ) -> Result<Option<RemotePackageInfo>> {
        let response = self.client.get(self.package_url(instance)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let info: RemotePackageInfo = response.error_for_status()?.json().await?;
        if info.key != *instance {
            return Err(DepotError::InvalidPackageInfo {
                key: instance.to_string(),
                reason: format!("feed '{}' answered for '{}'", self.typed_name(), info.key),
            });
        }
        Ok(Some(info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encodes_name_and_version() {
        let feed = HttpFeed::new("NuGet", "private", "https://feeds.example.com/");
        let inst: ArtifactInstance = "NuGet:My.Lib@1.0.0-rc.1".parse().unwrap();
        assert_eq!(
            feed.package_url(&inst),
            "https://feeds.example.com/packages/My.Lib/1.0.0-rc.1/json"
        );
    }

    #[test]
    fn payload_deserializes() {
        let json = r#"{
            "key": "NuGet:Foo@1.0.0",
            "savors": { "context": "tfm", "traits": ["net6.0", "net8.0"] },
            "dependencies": [
                {
                    "target": "NuGet:Bar@2.0.0",
                    "lock": "LockMinor",
                    "min_quality": "Stable",
                    "kind": "Transitive",
                    "savors": null
                }
            ]
        }"#;
        let info: RemotePackageInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.key.to_string(), "NuGet:Foo@1.0.0");
        assert_eq!(info.dependencies.len(), 1);
        assert_eq!(info.dependencies[0].target.name(), "Bar");
        assert!(info.savors.is_some());
    }
}
