//! Static table from pushed event name to the query classes it stales.

use std::collections::HashMap;

/// Query classes shared with the rest of the application.
pub mod keys {
    pub const ADMIN_PURCHASE_REQUESTS: &str = "adminPurchaseRequests";
    pub const ADMIN_ORDERS: &str = "adminOrders";
    pub const ADMIN_DASHBOARD: &str = "adminDashboard";
    pub const ADMIN_MEAL_PACKAGES: &str = "adminMealPackages";
    pub const ADMIN_MENUS: &str = "adminMenus";
    pub const MY_PACKAGES: &str = "myPackages";
    pub const MY_ACTIVE_PACKAGES: &str = "myActivePackages";
    pub const MY_PURCHASE_REQUESTS: &str = "myPurchaseRequests";
    pub const MY_ORDERS: &str = "myOrders";
    pub const MEAL_PACKAGES: &str = "mealPackages";
    pub const MEAL_PACKAGE: &str = "mealPackage";
    pub const TODAY_MENU: &str = "todayMenu";
    pub const DAILY_MENUS: &str = "dailyMenus";
    pub const AUTH: &str = "auth";
}

/// Event names pushed by the server.
pub struct EventName;

impl EventName {
    pub const PURCHASE_REQUEST_CREATED: &'static str = "purchase_request_created";
    pub const PURCHASE_REQUEST_APPROVED: &'static str = "purchase_request_approved";
    pub const PURCHASE_REQUEST_REJECTED: &'static str = "purchase_request_rejected";
    pub const ORDER_CREATED: &'static str = "order_created";
    pub const ORDER_UPDATED: &'static str = "order_updated";
    pub const ORDER_CONFIRMED: &'static str = "order_confirmed";
    pub const MEAL_PACKAGE_CREATED: &'static str = "meal_package_created";
    pub const MEAL_PACKAGE_UPDATED: &'static str = "meal_package_updated";
    pub const MEAL_PACKAGE_DELETED: &'static str = "meal_package_deleted";
    pub const MENU_CREATED: &'static str = "menu_created";
    pub const MENU_UPDATED: &'static str = "menu_updated";
    pub const MENU_LOCKED: &'static str = "menu_locked";
    pub const MENU_UNLOCKED: &'static str = "menu_unlocked";
}

const PACKAGE_CATALOG: &[&str] = &[keys::MEAL_PACKAGES, keys::ADMIN_MEAL_PACKAGES];
const MENUS: &[&str] = &[keys::TODAY_MENU, keys::DAILY_MENUS, keys::ADMIN_MENUS];
const ADMIN_ORDER_VIEWS: &[&str] = &[keys::ADMIN_ORDERS, keys::ADMIN_DASHBOARD];

const STANDARD_TABLE: &[(&str, &[&str])] = &[
    (
        EventName::PURCHASE_REQUEST_CREATED,
        &[keys::ADMIN_PURCHASE_REQUESTS, keys::ADMIN_DASHBOARD],
    ),
    (
        EventName::PURCHASE_REQUEST_APPROVED,
        &[keys::MY_PURCHASE_REQUESTS, keys::MY_PACKAGES],
    ),
    (
        EventName::PURCHASE_REQUEST_REJECTED,
        &[keys::MY_PURCHASE_REQUESTS],
    ),
    (EventName::ORDER_CREATED, ADMIN_ORDER_VIEWS),
    (EventName::ORDER_UPDATED, ADMIN_ORDER_VIEWS),
    (
        EventName::ORDER_CONFIRMED,
        &[keys::MY_ORDERS, keys::MY_ACTIVE_PACKAGES],
    ),
    (EventName::MEAL_PACKAGE_CREATED, PACKAGE_CATALOG),
    (EventName::MEAL_PACKAGE_UPDATED, PACKAGE_CATALOG),
    (EventName::MEAL_PACKAGE_DELETED, PACKAGE_CATALOG),
    (EventName::MENU_CREATED, MENUS),
    (EventName::MENU_UPDATED, MENUS),
    (EventName::MENU_LOCKED, MENUS),
    (EventName::MENU_UNLOCKED, MENUS),
];

/// Lookup table built once at startup and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct InvalidationMap {
    table: HashMap<&'static str, &'static [&'static str]>,
}

impl Default for InvalidationMap {
    fn default() -> Self {
        Self::standard()
    }
}

impl InvalidationMap {
    pub fn standard() -> Self {
        Self::from_table(STANDARD_TABLE)
    }

    pub fn from_table(entries: &'static [(&'static str, &'static [&'static str])]) -> Self {
        Self {
            table: entries.iter().copied().collect(),
        }
    }

    /// Classes staled by `event`; empty for unknown events.
    pub fn keys_for(&self, event: &str) -> &'static [&'static str] {
        self.table.get(event).copied().unwrap_or(&[])
    }

    pub fn events(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.table.keys().copied()
    }
}
