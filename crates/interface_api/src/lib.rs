//! HTTP API Layer
//!
//! This crate provides the REST API for the lesson billing engine using Axum.
//!
//! # Architecture
//!
//! - **Handlers**: Request handlers per resource
//! - **Middleware**: Request ids, tracing, audit logging
//! - **DTOs**: Request bodies, checked with `validator` before reaching the engine
//! - **Error Handling**: Engine error kinds mapped onto status codes
//!
//! Every billing route is scoped to an organisation:
//! `/api/v1/orgs/:org_id/...`.
//!
//! # Example
//!
//! ```rust,ignore
//! use interface_api::{create_router, AppState};
//!
//! let state = AppState::in_memory(config);
//! let app = create_router(state);
//! axum::serve(listener, app).await?;
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod dto;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod middleware;

use axum::{
    middleware as axum_middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use core_kernel::{Clock, SystemClock};
use domain_billing::adapters::{
    InMemoryLessonSource, InMemoryOrgConfigSource, InMemoryPaymentGateway, TracingNotifier,
};
use domain_billing::BillingEngine;

use crate::config::ApiConfig;
use crate::handlers::{billing, credits, health, invoices, payments};
use crate::middleware::audit_middleware;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<BillingEngine>,
    /// Lesson feed written by the ingestion endpoint
    pub lessons: Arc<InMemoryLessonSource>,
    /// Organisation settings written by the config endpoint
    pub configs: Arc<InMemoryOrgConfigSource>,
    pub gateway: Arc<InMemoryPaymentGateway>,
    pub config: ApiConfig,
}

impl AppState {
    /// State backed by in-memory adapters and the system clock
    pub fn in_memory(config: ApiConfig) -> Self {
        Self::in_memory_with_clock(config, Arc::new(SystemClock))
    }

    pub fn in_memory_with_clock(config: ApiConfig, clock: Arc<dyn Clock>) -> Self {
        let lessons = Arc::new(InMemoryLessonSource::new());
        let configs = Arc::new(InMemoryOrgConfigSource::new());
        let gateway = Arc::new(InMemoryPaymentGateway::new());
        let engine = BillingEngine::new(
            lessons.clone(),
            configs.clone(),
            gateway.clone(),
            Arc::new(TracingNotifier),
        )
        .with_clock(clock);

        Self {
            engine: Arc::new(engine),
            lessons,
            configs,
            gateway,
            config,
        }
    }
}

/// Creates the main API router
pub fn create_router(state: AppState) -> Router {
    let public_routes = Router::new().route("/health", get(health::health_check));

    let org_routes = Router::new()
        .route("/config", put(billing::put_config))
        .route("/lessons", post(billing::upsert_lessons))
        .route("/billing-runs", post(billing::run_billing))
        .route("/overdue/refresh", post(billing::refresh_overdue))
        .route("/invoices", get(invoices::list_invoices))
        .route("/invoices/:invoice_id", get(invoices::get_invoice))
        .route("/invoices/:invoice_id/send", post(invoices::send_invoice))
        .route("/invoices/:invoice_id/void", post(invoices::void_invoice))
        .route("/invoices/:invoice_id/payments", post(invoices::record_payment))
        .route("/invoices/:invoice_id/charge", post(invoices::charge_invoice))
        .route(
            "/invoices/:invoice_id/installment-plan",
            post(invoices::create_plan)
                .get(invoices::get_plan)
                .delete(invoices::remove_plan),
        )
        .route("/installments/:installment_id/payments", post(payments::pay_installment))
        .route("/payments/:payment_id/refunds", post(payments::issue_refund))
        .route("/refunds/:refund_id/settlement", post(payments::settle_refund))
        .route("/credits", post(credits::issue_credit))
        .route("/credits/cancellations", post(credits::credit_cancellation))
        .route("/credits/:credit_id/redeem", post(credits::redeem_credit))
        .route("/students/:student_id/credits", get(credits::student_credits));

    let api_routes = Router::new()
        .nest("/orgs/:org_id", org_routes)
        .layer(axum_middleware::from_fn(audit_middleware));

    Router::new()
        .merge(public_routes)
        .nest("/api/v1", api_routes)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
