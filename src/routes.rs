use std::sync::Arc;

use axum::{
    Router,
    extract::FromRef,
    routing::{get, patch, post, put},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::Config;
use crate::database::Db;
use crate::{
    auth, balances, categories, entries, payment_methods, recurring_rules, scheduler, sync,
};

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Arc<Config>,
}

impl FromRef<AppState> for Db {
    fn from_ref(state: &AppState) -> Self {
        state.db.clone()
    }
}

impl FromRef<AppState> for Arc<Config> {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

/// Every route except the session layer, which the caller attaches.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me))
        .route("/family/members", post(auth::add_family_member))
        .route("/entries", post(entries::handle_create_entry))
        .route(
            "/entries/{id}",
            patch(entries::handle_update_entry).delete(entries::handle_delete_entry),
        )
        .route("/entry-categories", post(categories::handle_create_category))
        .route(
            "/entry-categories/{id}",
            patch(categories::handle_update_category),
        )
        .route(
            "/payment-methods",
            post(payment_methods::handle_create_payment_method),
        )
        .route(
            "/payment-methods/{id}",
            patch(payment_methods::handle_update_payment_method)
                .delete(payment_methods::handle_delete_payment_method),
        )
        .route(
            "/recurring-rules",
            post(recurring_rules::handle_create_recurring_rule),
        )
        .route(
            "/recurring-rules/{id}",
            patch(recurring_rules::handle_update_recurring_rule)
                .delete(recurring_rules::handle_delete_recurring_rule),
        )
        .route("/monthly-balance", get(balances::get_monthly_balance))
        .route("/monthly-balances", get(balances::get_monthly_balances))
        .route("/monthly-balance/{ym}", put(balances::put_monthly_balance))
        .route("/sync", get(sync::get_sync))
        .route("/bootstrap", get(sync::get_bootstrap))
        .route("/scheduler/tick", post(scheduler::trigger_tick))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
