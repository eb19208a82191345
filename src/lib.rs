pub mod auth;
pub mod cache;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod fetcher;
pub mod invalidation;
pub mod notify;
pub mod pages;
pub mod transport;
pub mod types;

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use config::Config;
use notify::{Notification, NotificationSink};
use types::{Identity, QueryKey, Role};

/// Everything the client runs on, shared by the binary's tasks.
pub struct AppState {
    pub cache: cache::QueryCache,
    pub dispatcher: Arc<dispatcher::EventDispatcher>,
    pub manager: channel::ChannelManager,
    pub session: Arc<auth::SessionStore>,
    pub fetcher: Arc<dyn fetcher::QueryFetcher>,
    /// Pages mounted for the current identity.
    pub pages: RwLock<Vec<pages::MountedPage>>,
    admin_menu: Option<(String, String)>,
    watch_package: Option<String>,
}

impl AppState {
    pub fn initialize(config: &Config) -> (Arc<Self>, Option<mpsc::Receiver<Notification>>) {
        let cache = cache::QueryCache::new();

        // A zero buffer means notifications only go to the log.
        let (sink, notifications) = if config.notify_buffer == 0 {
            let sink: Arc<dyn NotificationSink> = Arc::new(notify::TracingSink);
            (sink, None)
        } else {
            let (sink, rx) = notify::ChannelSink::new(config.notify_buffer);
            let sink: Arc<dyn NotificationSink> = Arc::new(sink);
            (sink, Some(rx))
        };

        let dispatcher = Arc::new(dispatcher::EventDispatcher::new(
            invalidation::InvalidationMap::standard(),
            Arc::new(cache.clone()),
            sink,
        ));
        let manager = channel::ChannelManager::new(
            Arc::new(transport::WsTransport::new(config.push_url.clone())),
            dispatcher.clone(),
            channel::ChannelSettings {
                backoff_initial: config.backoff_initial,
                backoff_max: config.backoff_max,
                handshake_timeout: config.handshake_timeout,
            },
        );
        let session = Arc::new(auth::SessionStore::new());
        let fetcher = Arc::new(fetcher::HttpQueryFetcher::new(
            &config.api_base_url,
            session.subscribe(),
        ));

        let state = Arc::new(Self {
            cache,
            dispatcher,
            manager,
            session,
            fetcher,
            pages: RwLock::new(Vec::new()),
            admin_menu: config.admin_menu.clone(),
            watch_package: config.watch_package.clone(),
        });
        (state, notifications)
    }

    /// Replaces the mounted pages with the ones `identity` sees. Results only
    /// the previous pages read are evicted.
    pub fn mount_for(&self, identity: Option<&Identity>) -> anyhow::Result<()> {
        let d = &self.dispatcher;
        let mut mounted = Vec::new();
        match identity.map(|id| id.role) {
            None => {}
            Some(Role::Customer) => {
                mounted.push(pages::my_packages(d));
                mounted.push(pages::order_history(d));
                if let Some(id) = &self.watch_package {
                    mounted.push(pages::package_detail(d, id)?);
                }
            }
            Some(Role::Admin) => {
                mounted.push(pages::admin_packages(d)?);
                if let Some((menu_id, date)) = &self.admin_menu {
                    mounted.push(pages::admin_orders(d, menu_id, date)?);
                }
            }
        }
        for page in &mounted {
            info!(page = %page.name, handlers = page.handler_count(), "page mounted");
        }

        let previous = std::mem::replace(&mut *self.pages.write(), mounted);
        let still_read: Vec<QueryKey> = self.mounted_reads(None);
        for page in previous {
            for key in &page.reads {
                if !still_read.contains(key) {
                    self.cache.remove(key);
                }
            }
            debug!(page = %page.name, "page unmounted");
            page.unmount();
        }
        Ok(())
    }

    fn mounted_reads(&self, class: Option<&str>) -> Vec<QueryKey> {
        self.pages
            .read()
            .iter()
            .flat_map(|page| page.reads.iter().cloned())
            .filter(|key| class.map_or(true, |c| &*key.class == c))
            .collect()
    }

    /// Fetches the stale or missing reads of mounted pages, optionally only
    /// those of one class.
    pub async fn refresh(&self, class: Option<&str>) {
        for key in self.mounted_reads(class) {
            if self.cache.is_stale(&key) == Some(false) {
                continue;
            }
            match self.cache.get_or_fetch(&key, self.fetcher.as_ref()).await {
                Ok(_) => debug!(query = %key, "view refreshed"),
                Err(e) => warn!(query = %key, error = %e, "view refresh failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::invalidation::{keys, EventName};

    fn config() -> Config {
        Config {
            push_url: "ws://127.0.0.1:1/ws".into(),
            api_base_url: "http://127.0.0.1:1/api".into(),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            notify_buffer: 8,
            session_token: None,
            admin_menu: Some(("menu-1".into(), "2024-05-01".into())),
            watch_package: Some("pkg-9".into()),
        }
    }

    fn page_names(state: &AppState) -> Vec<String> {
        state.pages.read().iter().map(|p| p.name.clone()).collect()
    }

    #[test]
    fn admin_mounts_configured_order_view() {
        let (state, _rx) = AppState::initialize(&config());
        let admin = Identity::new("a-1", Role::Admin, "admin-token");
        state.mount_for(Some(&admin)).unwrap();

        assert_eq!(
            page_names(&state),
            vec!["admin_packages", "admin_orders:2024-05-01:menu-1"]
        );
        assert_eq!(state.dispatcher.registration_count(EventName::ORDER_CREATED), 1);
    }

    #[test]
    fn customer_mounts_watched_package() {
        let (state, _rx) = AppState::initialize(&config());
        let customer = Identity::new("u-1", Role::Customer, "customer-token");
        state.mount_for(Some(&customer)).unwrap();

        assert_eq!(
            page_names(&state),
            vec!["my_packages", "order_history", "package_detail:pkg-9"]
        );
        assert_eq!(
            state
                .dispatcher
                .registration_count(EventName::PURCHASE_REQUEST_APPROVED),
            2
        );
    }

    #[test]
    fn logout_unmounts_and_evicts_page_reads() {
        let (state, _rx) = AppState::initialize(&config());
        let customer = Identity::new("u-1", Role::Customer, "customer-token");
        state.mount_for(Some(&customer)).unwrap();
        let orders = QueryKey::class(keys::MY_ORDERS);
        state.cache.put(orders.clone(), json!([]));

        state.mount_for(None).unwrap();

        assert!(page_names(&state).is_empty());
        assert_eq!(state.dispatcher.registration_count(EventName::ORDER_CONFIRMED), 0);
        assert!(state.cache.get(&orders).is_none());
    }
}
