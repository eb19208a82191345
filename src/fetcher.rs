use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use tokio::sync::watch;

use crate::invalidation::keys;
use crate::types::{Identity, QueryKey};

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
    #[error("no route for query class {0}")]
    UnknownQuery(String),
    #[error("not signed in")]
    Unauthenticated,
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// Source of fresh query results for the cache.
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    async fn fetch(&self, key: &QueryKey) -> Result<Value, FetchError>;
}

/// REST path serving a query class. String params become a trailing path
/// segment, object params become query-string pairs.
pub fn route_for(class: &str) -> Option<&'static str> {
    let path = match class {
        keys::ADMIN_PURCHASE_REQUESTS => "/package-purchases",
        keys::ADMIN_ORDERS => "/orders/date",
        keys::ADMIN_DASHBOARD => "/admin/dashboard",
        keys::ADMIN_MEAL_PACKAGES => "/admin/meal-packages",
        keys::ADMIN_MENUS => "/admin/menus",
        keys::MY_PACKAGES => "/user-packages/my",
        keys::MY_ACTIVE_PACKAGES => "/user-packages/my/active",
        keys::MY_PURCHASE_REQUESTS => "/package-purchases/my",
        keys::MY_ORDERS => "/orders/my",
        keys::MEAL_PACKAGES => "/meal-packages",
        keys::MEAL_PACKAGE => "/meal-packages",
        keys::TODAY_MENU => "/menus/today",
        keys::DAILY_MENUS => "/menus",
        keys::AUTH => "/auth/me",
        _ => return None,
    };
    Some(path)
}

pub struct HttpQueryFetcher {
    client: Client,
    base_url: String,
    session: watch::Receiver<Option<Identity>>,
}

impl HttpQueryFetcher {
    pub fn new(base_url: &str, session: watch::Receiver<Option<Identity>>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
        }
    }

    fn url_for(&self, key: &QueryKey) -> Result<(Url, Vec<(String, String)>), FetchError> {
        let path =
            route_for(&key.class).ok_or_else(|| FetchError::UnknownQuery(key.class.to_string()))?;
        let mut url = Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        let mut query = Vec::new();

        let segment = match key.params_value() {
            Value::Null => None,
            Value::String(segment) => Some(segment),
            Value::Object(map) => {
                for (name, value) in map {
                    let value = match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    query.push((name, value));
                }
                None
            }
            other => Some(other.to_string()),
        };
        if let Some(segment) = segment {
            // Pushed segments are percent-encoded, so ids cannot escape the route.
            let base = url.to_string();
            url.path_segments_mut()
                .map_err(|_| FetchError::InvalidUrl(base))?
                .push(&segment);
        }

        Ok((url, query))
    }
}

#[async_trait]
impl QueryFetcher for HttpQueryFetcher {
    async fn fetch(&self, key: &QueryKey) -> Result<Value, FetchError> {
        let credential = self
            .session
            .borrow()
            .as_ref()
            .map(|identity| identity.credential.clone())
            .ok_or(FetchError::Unauthenticated)?;

        let (url, query) = self.url_for(key)?;
        let resp = self
            .client
            .get(url)
            .query(&query)
            .bearer_auth(credential.as_ref())
            .send()
            .await?
            .error_for_status()?;

        let body: Value = resp.json().await?;
        // Responses are enveloped as { "data": ... }.
        Ok(match body {
            Value::Object(mut map) if map.contains_key("data") => {
                map.remove("data").unwrap_or(Value::Null)
            }
            other => other,
        })
    }
}
