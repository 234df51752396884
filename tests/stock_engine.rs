use chrono::NaiveDate;
use pharmacy_stock::{
    database::{run_migrations, Database},
    error::StockError,
    models::{
        BranchAccess, DiscountType, OrderStatus, OrderType, PaymentMethod, PaymentStatus, RestockEntry, Role,
    },
    stock::{
        assign_orders, check_availability, commit_order, commit_sale, compute_available, delete_restock,
        edit_order_lines, edit_sale, get_stock_status, list_batch_numbers, list_branch_stock,
        list_incoming_orders, list_restocks, record_restock, record_restocks, update_order_status,
        update_payment_status, update_restock, Assignment, BandPolicy, DeliveryDetails, IncomingFilter,
        LineItem, OrderDraft, OrderEdit, PageRequest, RestockBatch, RestockDraft, RestockFilter,
        RestockLine, RestockUpdate, SaleDraft, SaleEdit, StockFilter, StockRequest, StockScope,
        StockStatus, StockStatusFilter, TaxPolicy,
    },
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

// These tests need a disposable Postgres database.
// Run with: TEST_DATABASE_URL=postgres://... cargo test -- --ignored

async fn pool() -> Database {
    let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set");
    let db = PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .expect("db connect");
    run_migrations(&db).await.expect("migrations");
    db
}

async fn seed_branch(db: &Database) -> Uuid {
    sqlx::query_scalar("INSERT INTO branches (name) VALUES ($1) RETURNING id")
        .bind(format!("Branch {}", Uuid::new_v4()))
        .fetch_one(db)
        .await
        .expect("seed branch")
}

async fn seed_user(db: &Database, role: Role) -> Uuid {
    sqlx::query_scalar(
        "INSERT INTO users (email, first_name, last_name, role) VALUES ($1, 'Test', 'User', $2) RETURNING id",
    )
    .bind(format!("{}@example.com", Uuid::new_v4()))
    .bind(role.as_str())
    .fetch_one(db)
    .await
    .expect("seed user")
}

async fn seed_product(db: &Database, floor_level: i32) -> Uuid {
    sqlx::query_scalar(
        "INSERT INTO products (name, sku, unit_price, cost_price, floor_level) VALUES ('Amoxicillin 500mg', $1, 12.50, 7.00, $2) RETURNING id",
    )
    .bind(format!("SKU-{}", Uuid::new_v4()))
    .bind(floor_level)
    .fetch_one(db)
    .await
    .expect("seed product")
}

fn expiry() -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 1).unwrap()
}

async fn restock(db: &Database, product_id: Uuid, branch_id: Uuid, quantity: i32) -> RestockEntry {
    record_restock(
        db,
        RestockDraft {
            product_id,
            branch_id,
            quantity,
            expiry_date: expiry(),
            batch_number: None,
        },
    )
    .await
    .expect("restock")
}

fn sale(branch_id: Uuid, employee_id: Uuid, product_id: Uuid, quantity: i32) -> SaleDraft {
    SaleDraft {
        branch_id,
        employee_id,
        customer_id: None,
        lines: vec![LineItem { product_id, quantity, unit_price: None, subtotal: None }],
        tax: Decimal::ZERO,
        discount: Decimal::ZERO,
        discount_type: DiscountType::Fixed,
        payment_method: PaymentMethod::Cash,
        payment_status: PaymentStatus::Paid,
        notes: None,
    }
}

fn order(customer_id: Uuid, branch_id: Option<Uuid>, status: OrderStatus, product_id: Uuid, quantity: i32) -> OrderDraft {
    OrderDraft {
        customer_id,
        branch_id,
        order_type: OrderType::Pickup,
        status,
        lines: vec![LineItem { product_id, quantity, unit_price: None, subtotal: None }],
        tax: TaxPolicy::Rate(dec!(0.08)),
        discount: Decimal::ZERO,
        discount_type: DiscountType::Fixed,
        delivery_fee: Decimal::ZERO,
        delivery: DeliveryDetails::default(),
        notes: None,
        created_by: customer_id,
    }
}

fn lines(product_id: Uuid, quantity: i32) -> Vec<LineItem> {
    vec![LineItem { product_id, quantity, unit_price: None, subtotal: None }]
}

async fn available(db: &Database, product_id: Uuid, branch_id: Uuid) -> i64 {
    let mut conn = db.acquire().await.unwrap();
    compute_available(&mut conn, product_id, StockScope::Branch(branch_id))
        .await
        .unwrap()
}

async fn row_count(db: &Database, table: &str, branch_id: Uuid) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {} WHERE branch_id = $1", table))
        .bind(branch_id)
        .fetch_one(db)
        .await
        .unwrap()
}

#[tokio::test]
#[ignore]
async fn sale_moves_product_below_floor() {
    let db = pool().await;
    let branch = seed_branch(&db).await;
    let employee = seed_user(&db, Role::Employee).await;
    let product = seed_product(&db, 50).await;
    restock(&db, product, branch, 100).await;

    let before = get_stock_status(&db, product, branch, BandPolicy::ExactBand).await.unwrap();
    assert_eq!(before.available, 100);
    assert_eq!(before.status, StockStatus::InStock);

    commit_sale(&db, sale(branch, employee, product, 60)).await.unwrap();

    let after = get_stock_status(&db, product, branch, BandPolicy::ExactBand).await.unwrap();
    assert_eq!(after.available, 40);
    assert_eq!(after.status, StockStatus::Reorder);

    // Reads are idempotent.
    assert_eq!(get_stock_status(&db, product, branch, BandPolicy::ExactBand).await.unwrap(), after);
}

#[tokio::test]
#[ignore]
async fn consuming_orders_count_against_availability() {
    let db = pool().await;
    let branch = seed_branch(&db).await;
    let customer = seed_user(&db, Role::Customer).await;
    let product = seed_product(&db, 60).await;
    restock(&db, product, branch, 50).await;

    let ready = commit_order(&db, order(customer, Some(branch), OrderStatus::Ready, product, 10)).await.unwrap();
    commit_order(&db, order(customer, Some(branch), OrderStatus::Pending, product, 5)).await.unwrap();

    let report = get_stock_status(&db, product, branch, BandPolicy::ExactBand).await.unwrap();
    assert_eq!(report.available, 40);
    assert_eq!(report.status, StockStatus::Critical);

    // Cancelling releases the stock.
    update_order_status(&db, &[ready], OrderStatus::Cancelled, customer, &BranchAccess::All)
        .await
        .unwrap();
    assert_eq!(available(&db, product, branch).await, 50);
}

#[tokio::test]
#[ignore]
async fn overdrawn_batch_is_rejected_whole() {
    let db = pool().await;
    let branch = seed_branch(&db).await;
    let employee = seed_user(&db, Role::Employee).await;
    let short = seed_product(&db, 10).await;
    let plenty = seed_product(&db, 10).await;
    restock(&db, short, branch, 5).await;
    restock(&db, plenty, branch, 100).await;

    let mut draft = sale(branch, employee, short, 3);
    draft.lines.push(LineItem { product_id: plenty, quantity: 2, unit_price: None, subtotal: None });
    draft.lines.push(LineItem { product_id: short, quantity: 4, unit_price: None, subtotal: None });

    match commit_sale(&db, draft).await {
        Err(StockError::InsufficientStock(violations)) => {
            assert_eq!(violations.len(), 1);
            assert_eq!(violations[0].product_id, short);
            assert_eq!(violations[0].requested, 7);
            assert_eq!(violations[0].available, 5);
        }
        other => panic!("expected insufficient stock, got {:?}", other),
    }

    assert_eq!(row_count(&db, "sales", branch).await, 0);
    assert_eq!(available(&db, short, branch).await, 5);
    assert_eq!(available(&db, plenty, branch).await, 100);
}

#[tokio::test]
#[ignore]
async fn concurrent_sales_never_oversell() {
    let db = pool().await;
    let branch = seed_branch(&db).await;
    let employee = seed_user(&db, Role::Employee).await;
    let product = seed_product(&db, 1).await;
    restock(&db, product, branch, 5).await;

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let db = db.clone();
            tokio::spawn(async move { commit_sale(&db, sale(branch, employee, product, 5)).await })
        })
        .collect();

    let mut committed = 0;
    let mut rejected = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => committed += 1,
            Err(StockError::InsufficientStock(_)) => rejected += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!((committed, rejected), (1, 1));
    assert_eq!(available(&db, product, branch).await, 0);
}

#[tokio::test]
#[ignore]
async fn unpaid_sales_start_counting_once_paid() {
    let db = pool().await;
    let branch = seed_branch(&db).await;
    let employee = seed_user(&db, Role::Employee).await;
    let product = seed_product(&db, 0).await;
    restock(&db, product, branch, 10).await;

    let mut pending = sale(branch, employee, product, 8);
    pending.payment_status = PaymentStatus::Pending;
    let pending_id = commit_sale(&db, pending).await.unwrap();
    assert_eq!(available(&db, product, branch).await, 10);

    let paid_id = commit_sale(&db, sale(branch, employee, product, 5)).await.unwrap();
    assert_eq!(available(&db, product, branch).await, 5);

    // Paying the first sale would overdraw the branch.
    let err = update_payment_status(&db, pending_id, PaymentStatus::Paid).await.unwrap_err();
    assert!(matches!(err, StockError::InsufficientStock(_)));

    update_payment_status(&db, paid_id, PaymentStatus::Refunded).await.unwrap();
    let sale = update_payment_status(&db, pending_id, PaymentStatus::Paid).await.unwrap();
    assert_eq!(sale.payment_status, PaymentStatus::Paid);
    assert_eq!(available(&db, product, branch).await, 2);
}

#[tokio::test]
#[ignore]
async fn requested_orders_wait_for_assignment() {
    let db = pool().await;
    let branch = seed_branch(&db).await;
    let admin = seed_user(&db, Role::Admin).await;
    let customer = seed_user(&db, Role::Customer).await;
    let product = seed_product(&db, 0).await;
    restock(&db, product, branch, 4).await;

    let order_id = commit_order(&db, order(customer, None, OrderStatus::Requested, product, 3)).await.unwrap();
    let incoming = list_incoming_orders(&db, &IncomingFilter::default(), PageRequest::new(None, 200))
        .await
        .unwrap();
    assert!(incoming.items.iter().any(|o| o.id == order_id));

    // Requested orders hold nothing.
    assert_eq!(available(&db, product, branch).await, 4);

    let assigned = assign_orders(
        &db,
        Assignment {
            order_ids: vec![order_id, Uuid::new_v4()],
            branch_id: branch,
            discount: dec!(10),
            discount_type: DiscountType::Percentage,
            delivery_fee: Decimal::ZERO,
            status: Some(OrderStatus::Ready),
            assigned_by: admin,
        },
    )
    .await
    .unwrap();
    assert_eq!(assigned, 1);
    assert_eq!(available(&db, product, branch).await, 1);

    let (branch_id, total): (Option<Uuid>, Decimal) =
        sqlx::query_as("SELECT branch_id, total FROM orders WHERE id = $1")
            .bind(order_id)
            .fetch_one(&db)
            .await
            .unwrap();
    assert_eq!(branch_id, Some(branch));
    // 3 x 12.50 = 37.50, tax 3.00, discount 3.75
    assert_eq!(total, dec!(36.75));
}

#[tokio::test]
#[ignore]
async fn preview_and_listing_agree_with_the_ledgers() {
    let db = pool().await;
    let branch = seed_branch(&db).await;
    let employee = seed_user(&db, Role::Employee).await;
    let product = seed_product(&db, 25).await;
    restock(&db, product, branch, 20).await;
    restock(&db, product, branch, 20).await;
    commit_sale(&db, sale(branch, employee, product, 30)).await.unwrap();

    let report = check_availability(
        &db,
        StockScope::Branch(branch),
        &[StockRequest { product_id: product, quantity: 11 }],
    )
    .await
    .unwrap();
    assert!(!report.ok);
    assert_eq!(report.violations[0].available, 10);

    let filter = StockFilter { status: Some(StockStatusFilter::Reorder), ..Default::default() };
    let page = list_branch_stock(&db, branch, &filter, PageRequest::new(None, 20)).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].available, 10);
    assert_eq!(page.items[0].status, StockStatus::Reorder);

    let none = StockFilter { status: Some(StockStatusFilter::InStock), ..Default::default() };
    assert_eq!(list_branch_stock(&db, branch, &none, PageRequest::new(None, 20)).await.unwrap().total, 0);
}

#[tokio::test]
#[ignore]
async fn inactive_products_stay_out_of_customer_checkout() {
    let db = pool().await;
    let branch = seed_branch(&db).await;
    let customer = seed_user(&db, Role::Customer).await;
    let product = seed_product(&db, 0).await;
    restock(&db, product, branch, 10).await;

    sqlx::query("UPDATE products SET is_active = FALSE WHERE id = $1")
        .bind(product)
        .execute(&db)
        .await
        .unwrap();

    let result = commit_order(&db, order(customer, None, OrderStatus::Requested, product, 2)).await;
    assert!(matches!(result, Err(StockError::NotFound("product"))), "got {:?}", result);

    let queued: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM orders WHERE customer_id = $1",
    )
    .bind(customer)
    .fetch_one(&db)
    .await
    .unwrap();
    assert_eq!(queued, 0);
}

#[tokio::test]
#[ignore]
async fn restock_corrections_cannot_strand_consumed_stock() {
    let db = pool().await;
    let branch = seed_branch(&db).await;
    let other_branch = seed_branch(&db).await;
    let employee = seed_user(&db, Role::Employee).await;
    let product = seed_product(&db, 0).await;
    let first = restock(&db, product, branch, 10).await;
    let second = restock(&db, product, branch, 5).await;
    commit_sale(&db, sale(branch, employee, product, 12)).await.unwrap();
    assert_eq!(available(&db, product, branch).await, 3);

    // Deleting the second delivery would leave -2 on the shelf.
    let err = delete_restock(&db, second.id).await.unwrap_err();
    assert!(matches!(err, StockError::InsufficientStock(_)));
    assert_eq!(available(&db, product, branch).await, 3);

    let lowered = update_restock(
        &db,
        first.id,
        RestockUpdate { branch_id: branch, quantity: 7, expiry_date: expiry() },
    )
    .await
    .unwrap();
    assert_eq!(lowered.quantity, 7);
    assert_eq!(available(&db, product, branch).await, 0);

    let moving = RestockUpdate { branch_id: other_branch, quantity: 5, expiry_date: expiry() };
    let err = update_restock(&db, second.id, moving).await.unwrap_err();
    assert!(matches!(err, StockError::InsufficientStock(_)));

    restock(&db, product, branch, 10).await;
    let moved = update_restock(&db, second.id, moving).await.unwrap();
    assert_eq!(moved.branch_id, other_branch);
    assert_eq!(available(&db, product, branch).await, 5);
    assert_eq!(available(&db, product, other_branch).await, 5);

    // Raising a delivery never needs the gate.
    update_restock(&db, first.id, RestockUpdate { branch_id: branch, quantity: 9, expiry_date: expiry() })
        .await
        .unwrap();
    assert_eq!(available(&db, product, branch).await, 7);

    delete_restock(&db, moved.id).await.unwrap();
    assert_eq!(available(&db, product, other_branch).await, 0);
    assert!(matches!(delete_restock(&db, moved.id).await, Err(StockError::NotFound("restock"))));
}

#[tokio::test]
#[ignore]
async fn bulk_restock_shares_one_batch() {
    let db = pool().await;
    let branch = seed_branch(&db).await;
    let a = seed_product(&db, 0).await;
    let b = seed_product(&db, 0).await;

    let entries = record_restocks(
        &db,
        RestockBatch {
            branch_id: branch,
            lines: vec![
                RestockLine { product_id: a, quantity: 12, expiry_date: expiry() },
                RestockLine { product_id: b, quantity: 30, expiry_date: expiry() },
            ],
            batch_number: None,
        },
    )
    .await
    .unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].batch_number, entries[1].batch_number);
    assert_eq!(available(&db, a, branch).await, 12);
    assert_eq!(available(&db, b, branch).await, 30);

    record_restocks(
        &db,
        RestockBatch {
            branch_id: branch,
            lines: vec![RestockLine { product_id: a, quantity: 3, expiry_date: expiry() }],
            batch_number: Some("B-1".into()),
        },
    )
    .await
    .unwrap();

    let empty = RestockBatch { branch_id: branch, lines: vec![], batch_number: None };
    assert!(matches!(record_restocks(&db, empty).await, Err(StockError::InvalidRequest(_))));

    let history = list_restocks(&db, branch, &RestockFilter::default(), PageRequest::new(None, 20))
        .await
        .unwrap();
    assert_eq!(history.total, 3);
    assert_eq!(history.items[0].entry.batch_number, "B-1");

    let filter = RestockFilter { batch_number: Some("B-1".into()), ..Default::default() };
    let tagged = list_restocks(&db, branch, &filter, PageRequest::new(None, 20)).await.unwrap();
    assert_eq!(tagged.total, 1);
    assert_eq!(tagged.items[0].entry.product_id, a);

    let batches = list_batch_numbers(&db, branch).await.unwrap();
    assert_eq!(batches.len(), 2);
    assert!(batches.contains(&entries[0].batch_number));
}

#[tokio::test]
#[ignore]
async fn editing_a_ready_order_is_gated_and_repriced() {
    let db = pool().await;
    let branch = seed_branch(&db).await;
    let admin = seed_user(&db, Role::Admin).await;
    let customer = seed_user(&db, Role::Customer).await;
    let product = seed_product(&db, 0).await;
    restock(&db, product, branch, 10).await;

    let order_id = commit_order(&db, order(customer, Some(branch), OrderStatus::Ready, product, 4)).await.unwrap();
    assert_eq!(available(&db, product, branch).await, 6);

    let edit = |quantity| OrderEdit {
        lines: lines(product, quantity),
        tax: dec!(1.00),
        discount: Decimal::ZERO,
        discount_type: DiscountType::Fixed,
        delivery_fee: Decimal::ZERO,
        notes: Some("phone correction".into()),
        edited_by: admin,
    };

    // The order's own four units are released before the new lines are checked.
    let edited = edit_order_lines(&db, order_id, edit(9), &BranchAccess::All).await.unwrap();
    assert_eq!(edited.subtotal, dec!(112.50));
    assert_eq!(edited.total, dec!(113.50));
    assert_eq!(available(&db, product, branch).await, 1);

    let err = edit_order_lines(&db, order_id, edit(11), &BranchAccess::All).await.unwrap_err();
    assert!(matches!(err, StockError::InsufficientStock(_)));
    assert_eq!(available(&db, product, branch).await, 1);

    let elsewhere = BranchAccess::Only(vec![Uuid::new_v4()]);
    let err = edit_order_lines(&db, order_id, edit(1), &elsewhere).await.unwrap_err();
    assert!(matches!(err, StockError::Forbidden));
}

#[tokio::test]
#[ignore]
async fn editing_a_paid_sale_is_gated() {
    let db = pool().await;
    let branch = seed_branch(&db).await;
    let employee = seed_user(&db, Role::Employee).await;
    let product = seed_product(&db, 0).await;
    restock(&db, product, branch, 6).await;

    let sale_id = commit_sale(&db, sale(branch, employee, product, 5)).await.unwrap();
    assert_eq!(available(&db, product, branch).await, 1);

    let edit = |quantity| SaleEdit {
        lines: lines(product, quantity),
        tax: Decimal::ZERO,
        discount: dec!(5),
        discount_type: DiscountType::Fixed,
        payment_method: PaymentMethod::Card,
        notes: None,
    };

    let edited = edit_sale(&db, sale_id, edit(6)).await.unwrap();
    assert_eq!(edited.subtotal, dec!(75.00));
    assert_eq!(edited.total, dec!(70.00));
    assert_eq!(edited.payment_method, PaymentMethod::Card);
    assert_eq!(available(&db, product, branch).await, 0);

    let err = edit_sale(&db, sale_id, edit(7)).await.unwrap_err();
    assert!(matches!(err, StockError::InsufficientStock(_)));
    assert_eq!(available(&db, product, branch).await, 0);
}

#[tokio::test]
#[ignore]
async fn bulk_status_changes_gate_their_combined_demand() {
    let db = pool().await;
    let branch = seed_branch(&db).await;
    let customer = seed_user(&db, Role::Customer).await;
    let product = seed_product(&db, 0).await;
    restock(&db, product, branch, 5).await;

    let first = commit_order(&db, order(customer, Some(branch), OrderStatus::Pending, product, 3)).await.unwrap();
    let second = commit_order(&db, order(customer, Some(branch), OrderStatus::Pending, product, 3)).await.unwrap();

    let err = update_order_status(&db, &[first, second], OrderStatus::Ready, customer, &BranchAccess::All)
        .await
        .unwrap_err();
    match err {
        StockError::InsufficientStock(violations) => {
            assert_eq!(violations.len(), 1);
            assert_eq!(violations[0].requested, 6);
            assert_eq!(violations[0].available, 5);
        }
        other => panic!("expected insufficient stock, got {:?}", other),
    }
    assert_eq!(available(&db, product, branch).await, 5);
}

#[tokio::test]
#[ignore]
async fn overlapping_bulk_status_changes_do_not_deadlock() {
    let db = pool().await;
    let branch = seed_branch(&db).await;
    let customer = seed_user(&db, Role::Customer).await;
    let a = seed_product(&db, 0).await;
    let b = seed_product(&db, 0).await;
    restock(&db, a, branch, 1000).await;
    restock(&db, b, branch, 1000).await;

    for _ in 0..10 {
        // Both batches need both pairings, in whatever order their ids sort.
        let mut batches = Vec::new();
        for _ in 0..2 {
            let on_a = commit_order(&db, order(customer, Some(branch), OrderStatus::Pending, a, 1)).await.unwrap();
            let on_b = commit_order(&db, order(customer, Some(branch), OrderStatus::Pending, b, 1)).await.unwrap();
            batches.push(vec![on_a, on_b]);
        }

        let tasks: Vec<_> = batches
            .into_iter()
            .map(|ids| {
                let db = db.clone();
                tokio::spawn(async move {
                    update_order_status(&db, &ids, OrderStatus::Ready, customer, &BranchAccess::All).await
                })
            })
            .collect();

        for task in tasks {
            match task.await.unwrap() {
                Ok(updated) => assert_eq!(updated, 2),
                Err(e) => panic!("bulk status change failed: {}", e),
            }
        }
    }

    assert_eq!(available(&db, a, branch).await, 980);
    assert_eq!(available(&db, b, branch).await, 980);
}
