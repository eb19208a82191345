//! Page-scoped consumers. Each mounted page registers its handlers for as
//! long as the returned [`MountedPage`] lives; dropping it unmounts.

use serde_json::json;

use crate::dispatcher::{ConsumerContext, ConsumerHandle, EventDispatcher};
use crate::invalidation::{keys, EventName};
use crate::notify::{Notification, Variant};
use crate::types::QueryKey;

pub struct MountedPage {
    pub name: String,
    /// Queries the page renders from.
    pub reads: Vec<QueryKey>,
    handles: Vec<ConsumerHandle>,
}

impl MountedPage {
    pub fn handler_count(&self) -> usize {
        self.handles.len()
    }

    pub fn unmount(self) {
        for handle in self.handles {
            handle.release();
        }
    }
}

pub fn my_packages(dispatcher: &EventDispatcher) -> MountedPage {
    let scope = "my_packages";
    let approved = dispatcher.subscribe_scoped(scope, EventName::PURCHASE_REQUEST_APPROVED, |ctx| {
        let description = ctx
            .event
            .str_field("message")
            .unwrap_or("Your meal package has been activated.");
        ctx.notifier
            .notify(Notification::new(Variant::Success, "Congratulations!").describe(description));
        // The active package lives on the session profile.
        ctx.cache.invalidate(keys::AUTH);
        Ok(())
    });
    let rejected = dispatcher.subscribe_scoped(scope, EventName::PURCHASE_REQUEST_REJECTED, |ctx| {
        let description = ctx
            .event
            .str_field("message")
            .unwrap_or("Your package purchase request was rejected.");
        ctx.notifier
            .notify(Notification::new(Variant::Destructive, "Sorry").describe(description));
        Ok(())
    });

    MountedPage {
        name: scope.to_string(),
        reads: vec![
            QueryKey::class(keys::MY_PACKAGES),
            QueryKey::class(keys::MY_PURCHASE_REQUESTS),
        ],
        handles: vec![approved, rejected],
    }
}

pub fn package_detail(
    dispatcher: &EventDispatcher,
    package_id: &str,
) -> Result<MountedPage, serde_json::Error> {
    let scope = format!("package_detail:{package_id}");
    let package = QueryKey::with_params(keys::MEAL_PACKAGE, &json!(package_id))?;

    let id = package_id.to_string();
    let key = package.clone();
    let approved = dispatcher.subscribe_scoped(
        &scope,
        EventName::PURCHASE_REQUEST_APPROVED,
        move |ctx: &ConsumerContext<'_>| {
            if ctx.event.str_field("requestId") != Some(id.as_str()) {
                return Ok(());
            }
            ctx.notifier.notify(
                Notification::new(Variant::Success, "Great news!")
                    .describe("This meal package has been activated."),
            );
            ctx.cache.invalidate_key(&key);
            Ok(())
        },
    );

    Ok(MountedPage {
        name: scope,
        reads: vec![package],
        handles: vec![approved],
    })
}

pub fn admin_orders(
    dispatcher: &EventDispatcher,
    menu_id: &str,
    date: &str,
) -> Result<MountedPage, serde_json::Error> {
    let scope = format!("admin_orders:{date}:{menu_id}");
    let orders = QueryKey::with_params(keys::ADMIN_ORDERS, &json!(date))?;

    let handles = [EventName::ORDER_CREATED, EventName::ORDER_UPDATED]
        .into_iter()
        .map(|event| {
            let menu_id = menu_id.to_string();
            let key = orders.clone();
            dispatcher.subscribe_scoped(&scope, event, move |ctx: &ConsumerContext<'_>| {
                if ctx.event.str_field("menuId") != Some(menu_id.as_str()) {
                    return Ok(());
                }
                ctx.cache.invalidate_key(&key);
                ctx.notifier.notify(
                    Notification::new(Variant::Default, "New order!")
                        .describe("A customer just placed or changed an order."),
                );
                Ok(())
            })
        })
        .collect();

    Ok(MountedPage {
        name: scope,
        reads: vec![orders],
        handles,
    })
}

pub fn admin_packages(dispatcher: &EventDispatcher) -> Result<MountedPage, serde_json::Error> {
    let scope = "admin_packages";
    let created = dispatcher.subscribe_scoped(scope, EventName::PURCHASE_REQUEST_CREATED, |ctx| {
        ctx.notifier.notify(
            Notification::new(Variant::Default, "New request!")
                .describe("A customer is waiting for a package approval."),
        );
        Ok(())
    });

    Ok(MountedPage {
        name: scope.to_string(),
        reads: vec![
            QueryKey::with_params(keys::ADMIN_PURCHASE_REQUESTS, &json!({ "status": "pending" }))?,
            QueryKey::class(keys::ADMIN_MEAL_PACKAGES),
        ],
        handles: vec![created],
    })
}

pub fn order_history(dispatcher: &EventDispatcher) -> MountedPage {
    let scope = "order_history";
    let confirmed = dispatcher.subscribe_scoped(scope, EventName::ORDER_CONFIRMED, |ctx| {
        ctx.cache.invalidate(keys::MY_ORDERS);
        Ok(())
    });

    MountedPage {
        name: scope.to_string(),
        reads: vec![QueryKey::class(keys::MY_ORDERS)],
        handles: vec![confirmed],
    }
}
