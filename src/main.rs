use axum::{
    routing::{delete, get, patch, post, put},
    Router,
};
use dotenvy::dotenv;
use tower::ServiceBuilder;
use tower_cookies::CookieManagerLayer;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use pharmacy_stock::{
    config::AppConfig,
    database::{create_database_pool, run_migrations},
    handlers, AppState,
};

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    if let Err(e) = run().await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;

    let db = create_database_pool(&config).await?;
    run_migrations(&db).await?;
    log::info!("Database connection successful");

    let addr = config.listen_addr();
    let app = create_router(AppState::new(db, config));

    log::info!("Pharmacy stock server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn create_router(state: AppState) -> Router {
    Router::new()
        // Stock reads
        .route("/api/stock/check", post(handlers::api::check_stock))
        .route("/api/stock/:product_id/:branch_id", get(handlers::api::stock_status))
        .route("/api/branches/:branch_id/stock", get(handlers::inventory::branch_stock))
        .route("/api/branches/:branch_id/alerts", get(handlers::inventory::stock_alerts))

        // Restock ledger
        .route("/api/restock", post(handlers::inventory::create_restock))
        .route("/api/restock/bulk", post(handlers::inventory::create_restock_batch))
        .route(
            "/api/restock/:id",
            put(handlers::inventory::edit_restock).delete(handlers::inventory::remove_restock),
        )
        .route("/api/branches/:branch_id/restock", get(handlers::inventory::restock_history))

        // Point of sale
        .route("/pos/:branch_id/products", get(handlers::pos::pos_products))
        .route("/pos/sale", post(handlers::pos::create_sale))
        .route("/api/sales/:id/payment-status", patch(handlers::sales::set_payment_status))
        .route(
            "/api/sales/:id",
            put(handlers::sales::edit_sale).delete(handlers::sales::delete_sale),
        )

        // Orders
        .route("/api/orders", post(handlers::orders::create_order))
        .route("/customer/orders", post(handlers::orders::submit_order))
        .route("/api/orders/incoming", get(handlers::orders::incoming_orders))
        .route("/api/orders/incoming/assign", post(handlers::orders::assign_incoming))
        .route("/api/orders/status", post(handlers::orders::update_status))
        .route("/api/orders/:id", delete(handlers::orders::delete_order))
        .route("/api/orders/:id/items", put(handlers::orders::edit_order))

        // Middleware
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CookieManagerLayer::new())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
