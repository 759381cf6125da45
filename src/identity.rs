//! External identity service
//!
//! The identity service is the source of truth for which applications and
//! end devices exist and which rights a bearer token carries. The Join
//! Server asks it for application rights when a user calls a CRUD or
//! key-lookup operation, and the cleaner lists its applications and devices.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
#[cfg(feature = "remote")]
use tracing::debug;

use crate::auth::Right;
use crate::error::{Error, Result};

#[async_trait]
pub trait IdentityServer: Send + Sync {
    /// Resolve `token`. An unknown token yields `UNAUTHENTICATED`.
    async fn authenticate(&self, token: &str) -> Result<()>;

    /// Rights `token` holds on `application_id`. An unknown token yields
    /// `UNAUTHENTICATED`.
    async fn application_rights(&self, token: &str, application_id: &str) -> Result<Vec<Right>>;

    /// IDs of all applications.
    async fn list_applications(&self) -> Result<Vec<String>>;

    /// Device IDs registered under `application_id`.
    async fn list_end_devices(&self, application_id: &str) -> Result<Vec<String>>;
}

/// Identity service backed by fixed tables.
#[derive(Default)]
pub struct StaticIdentityServer {
    applications: RwLock<BTreeMap<String, Vec<String>>>,
    tokens: RwLock<HashMap<String, HashMap<String, Vec<Right>>>>,
}

impl StaticIdentityServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, application_id: &str, device_id: &str) {
        let mut apps = self.applications.write();
        let devices = apps.entry(application_id.to_string()).or_default();
        if !devices.iter().any(|d| d == device_id) {
            devices.push(device_id.to_string());
        }
    }

    pub fn remove_application(&self, application_id: &str) {
        self.applications.write().remove(application_id);
    }

    pub fn remove_device(&self, application_id: &str, device_id: &str) {
        if let Some(devices) = self.applications.write().get_mut(application_id) {
            devices.retain(|d| d != device_id);
        }
    }

    pub fn grant(&self, token: &str, application_id: &str, rights: &[Right]) {
        self.applications
            .write()
            .entry(application_id.to_string())
            .or_default();
        self.tokens
            .write()
            .entry(token.to_string())
            .or_default()
            .insert(application_id.to_string(), rights.to_vec());
    }
}

#[async_trait]
impl IdentityServer for StaticIdentityServer {
    async fn authenticate(&self, token: &str) -> Result<()> {
        if self.tokens.read().contains_key(token) {
            Ok(())
        } else {
            Err(Error::Unauthenticated("unknown token".to_string()))
        }
    }

    async fn application_rights(&self, token: &str, application_id: &str) -> Result<Vec<Right>> {
        let tokens = self.tokens.read();
        let apps = tokens
            .get(token)
            .ok_or_else(|| Error::Unauthenticated("unknown token".to_string()))?;
        Ok(apps.get(application_id).cloned().unwrap_or_default())
    }

    async fn list_applications(&self) -> Result<Vec<String>> {
        Ok(self.applications.read().keys().cloned().collect())
    }

    async fn list_end_devices(&self, application_id: &str) -> Result<Vec<String>> {
        Ok(self
            .applications
            .read()
            .get(application_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(feature = "remote")]
pub use http::HttpIdentityServer;

#[cfg(feature = "remote")]
mod http {
    use super::*;
    use reqwest::{Client, StatusCode};
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct RightsResponse {
        #[serde(default)]
        rights: Vec<String>,
    }

    #[derive(Deserialize)]
    struct ApplicationIds {
        application_id: String,
    }

    #[derive(Deserialize)]
    struct ApplicationsResponse {
        #[serde(default)]
        applications: Vec<ApplicationIds>,
    }

    #[derive(Deserialize)]
    struct DeviceIds {
        device_id: String,
    }

    #[derive(Deserialize)]
    struct EndDevicesResponse {
        #[serde(default)]
        end_devices: Vec<DeviceIds>,
    }

    /// HTTP/JSON client for the identity service API.
    pub struct HttpIdentityServer {
        http: Client,
        url: String,
        api_key: Option<String>,
    }

    impl HttpIdentityServer {
        pub fn new(url: &str, api_key: Option<String>) -> Result<Self> {
            let http = Client::builder().build().map_err(|e| {
                Error::IdentityServer(format!("failed to build HTTP client: {}", e))
            })?;
            Ok(Self {
                http,
                url: url.trim_end_matches('/').to_string(),
                api_key,
            })
        }

        async fn get<T: serde::de::DeserializeOwned>(
            &self,
            path: &str,
            token: Option<&str>,
        ) -> Result<T> {
            let url = format!("{}{}", self.url, path);
            debug!(url = %url, "Querying identity server");

            let mut req = self.http.get(&url);
            if let Some(token) = token.or(self.api_key.as_deref()) {
                req = req.bearer_auth(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| Error::IdentityServer(format!("request to {} failed: {}", url, e)))?;

            match resp.status() {
                StatusCode::UNAUTHORIZED => {
                    return Err(Error::Unauthenticated("token rejected".to_string()))
                }
                StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                    return Err(Error::PermissionDenied(format!("no access to {}", path)))
                }
                s if !s.is_success() => {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(Error::IdentityServer(format!(
                        "{} returned {}: {}",
                        url, s, body
                    )));
                }
                _ => {}
            }

            resp.json::<T>()
                .await
                .map_err(|e| Error::IdentityServer(format!("invalid response from {}: {}", url, e)))
        }
    }

    #[async_trait]
    impl IdentityServer for HttpIdentityServer {
        async fn authenticate(&self, token: &str) -> Result<()> {
            let _: serde_json::Value = self.get("/api/v3/auth_info", Some(token)).await?;
            Ok(())
        }

        async fn application_rights(
            &self,
            token: &str,
            application_id: &str,
        ) -> Result<Vec<Right>> {
            let resp: RightsResponse = self
                .get(
                    &format!("/api/v3/applications/{}/rights", application_id),
                    Some(token),
                )
                .await?;
            // Rights this server does not know about are irrelevant to it.
            Ok(resp.rights.iter().filter_map(|r| r.parse().ok()).collect())
        }

        async fn list_applications(&self) -> Result<Vec<String>> {
            let resp: ApplicationsResponse = self.get("/api/v3/applications", None).await?;
            Ok(resp
                .applications
                .into_iter()
                .map(|a| a.application_id)
                .collect())
        }

        async fn list_end_devices(&self, application_id: &str) -> Result<Vec<String>> {
            let resp: EndDevicesResponse = self
                .get(
                    &format!("/api/v3/applications/{}/devices", application_id),
                    None,
                )
                .await?;
            Ok(resp.end_devices.into_iter().map(|d| d.device_id).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_identity_server() {
        let is = StaticIdentityServer::new();
        is.add_device("app-1", "dev-1");
        is.add_device("app-1", "dev-2");
        is.add_device("app-1", "dev-1");
        is.grant("token-a", "app-1", &[Right::ApplicationDevicesRead]);
        assert!(is.authenticate("token-a").await.is_ok());
        assert_eq!(is.authenticate("token-b").await.unwrap_err().code(), "UNAUTHENTICATED");

        assert_eq!(is.list_applications().await.unwrap(), vec!["app-1"]);
        assert_eq!(
            is.list_end_devices("app-1").await.unwrap(),
            vec!["dev-1", "dev-2"]
        );
        assert_eq!(
            is.application_rights("token-a", "app-1").await.unwrap(),
            vec![Right::ApplicationDevicesRead]
        );
        assert!(is
            .application_rights("token-a", "app-2")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            is.application_rights("token-b", "app-1")
                .await
                .unwrap_err()
                .code(),
            "UNAUTHENTICATED"
        );

        is.remove_device("app-1", "dev-1");
        assert_eq!(is.list_end_devices("app-1").await.unwrap(), vec!["dev-2"]);
        is.remove_application("app-1");
        assert!(is.list_applications().await.unwrap().is_empty());
    }
}
