use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use salonbook::tenant::{TenantManager, TenantSettings};
use salonbook::wire;

/// 2026-10-15T00:00:00Z
const DAY: i64 = 1_792_022_400_000;
const H: i64 = 3_600_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("salonbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, TenantSettings::default()));

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "salonbook".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, db: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user("salonbook")
        .password("salonbook");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

struct Salon {
    business: Ulid,
    staff: Ulid,
    service: Ulid,
}

async fn setup_salon(client: &Client) -> Salon {
    let salon = Salon {
        business: Ulid::new(),
        staff: Ulid::new(),
        service: Ulid::new(),
    };
    client
        .batch_execute(&format!(
            "INSERT INTO businesses (id, name) VALUES ('{}', 'Island Cuts')",
            salon.business
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO staff (id, business_id, name, specialization) VALUES ('{}', '{}', 'Maya', 'braids')",
            salon.staff, salon.business
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO services (id, business_id, name, duration_minutes, price, category) VALUES ('{}', '{}', 'Haircut', 60, 25.00, 'hair')",
            salon.service, salon.business
        ))
        .await
        .unwrap();
    salon
}

async fn book(client: &Client, s: &Salon, client_id: Ulid, start: &str) -> Result<Ulid, tokio_postgres::Error> {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO appointments (id, client_id, business_id, service_id, staff_id, start) VALUES ('{id}', '{client_id}', '{}', '{}', '{}', {start})",
            s.business, s.service, s.staff
        ))
        .await?;
    Ok(id)
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn book_and_list_over_wire() {
    let addr = start_test_server().await;
    let client = connect(addr, "wire_book").await;
    let s = setup_salon(&client).await;

    let id = book(&client, &s, Ulid::new(), "'2026-10-15T14:00:00Z'").await.unwrap();

    let listed = rows(
        &client,
        &format!("SELECT * FROM appointments WHERE staff_id = '{}'", s.staff),
    )
    .await;
    assert_eq!(listed.len(), 1);
    let id_text = id.to_string();
    let start_text = (DAY + 14 * H).to_string();
    let end_text = (DAY + 15 * H).to_string();
    assert_eq!(listed[0].get("id"), Some(id_text.as_str()));
    assert_eq!(listed[0].get("start"), Some(start_text.as_str()));
    assert_eq!(listed[0].get("end"), Some(end_text.as_str()));
    assert_eq!(listed[0].get("status"), Some("pending"));
    assert!(listed[0].get("confirmation").unwrap().starts_with("BZ"));
}

#[tokio::test]
async fn overlapping_booking_rejected_over_wire() {
    let addr = start_test_server().await;
    let client = connect(addr, "wire_conflict").await;
    let s = setup_salon(&client).await;

    book(&client, &s, Ulid::new(), &(DAY + 14 * H).to_string()).await.unwrap();
    let err = book(&client, &s, Ulid::new(), &(DAY + 14 * H + 30 * 60_000).to_string())
        .await
        .unwrap_err();
    let db_err = err.as_db_error().expect("server error");
    assert_eq!(db_err.code().code(), "P0001");
    assert!(db_err.message().contains("conflict"));

    // Back-to-back is fine.
    book(&client, &s, Ulid::new(), &(DAY + 15 * H).to_string()).await.unwrap();
}

#[tokio::test]
async fn dry_run_conflict_check() {
    let addr = start_test_server().await;
    let client = connect(addr, "wire_dry_run").await;
    let s = setup_salon(&client).await;
    book(&client, &s, Ulid::new(), &(DAY + 14 * H).to_string()).await.unwrap();

    let check = |start: i64, duration: i64| {
        format!(
            "SELECT * FROM conflicts WHERE resource_id = '{}' AND start = {start} AND duration = {duration}",
            s.staff
        )
    };
    let hit = rows(&client, &check(DAY + 14 * H + 30 * 60_000, 60)).await;
    assert_eq!(hit[0].get("conflict"), Some("t"));
    let free = rows(&client, &check(DAY + 15 * H, 60)).await;
    assert_eq!(free[0].get("conflict"), Some("f"));

    let err = client.simple_query(&check(DAY + 15 * H, -1)).await.unwrap_err();
    assert!(err.as_db_error().unwrap().message().contains("invalid duration"));
}

#[tokio::test]
async fn status_feedback_and_ratings() {
    let addr = start_test_server().await;
    let client = connect(addr, "wire_feedback").await;
    let s = setup_salon(&client).await;
    let customer = Ulid::new();
    let id = book(&client, &s, customer, &(DAY + 10 * H).to_string()).await.unwrap();

    for status in ["confirmed", "completed"] {
        client
            .batch_execute(&format!("UPDATE appointments SET status = '{status}' WHERE id = '{id}'"))
            .await
            .unwrap();
    }
    client
        .batch_execute(&format!(
            "INSERT INTO feedback (id, appointment_id, rating, comments) VALUES ('{}', '{id}', 4, 'Great fade')",
            Ulid::new()
        ))
        .await
        .unwrap();

    let summary = rows(
        &client,
        &format!("SELECT * FROM ratings WHERE business_id = '{}'", s.business),
    )
    .await;
    assert_eq!(summary[0].get("count"), Some("1"));
    let average: f64 = summary[0].get("average").unwrap().parse().unwrap();
    assert_eq!(average, 4.0);

    let log = rows(
        &client,
        &format!("SELECT * FROM notifications WHERE user_id = '{customer}'"),
    )
    .await;
    let mut kinds: Vec<&str> = log.iter().filter_map(|n| n.get("kind")).collect();
    kinds.sort_unstable();
    assert_eq!(kinds, ["booking_confirmation", "follow_up"]);
}

#[tokio::test]
async fn cancel_then_rebook_same_slot() {
    let addr = start_test_server().await;
    let client = connect(addr, "wire_cancel").await;
    let s = setup_salon(&client).await;
    let start = (DAY + 9 * H).to_string();

    let id = book(&client, &s, Ulid::new(), &start).await.unwrap();
    client
        .batch_execute(&format!("DELETE FROM appointments WHERE id = '{id}'"))
        .await
        .unwrap();
    book(&client, &s, Ulid::new(), &start).await.unwrap();

    let cancelled = rows(&client, &format!("SELECT * FROM appointments WHERE id = '{id}'")).await;
    assert_eq!(cancelled[0].get("status"), Some("cancelled"));
}

#[tokio::test]
async fn services_listing_formats_price() {
    let addr = start_test_server().await;
    let client = connect(addr, "wire_services").await;
    let s = setup_salon(&client).await;

    let services = rows(
        &client,
        &format!("SELECT * FROM services WHERE business_id = '{}'", s.business),
    )
    .await;
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].get("price_cents"), Some("2500"));
    assert_eq!(services[0].get("price"), Some("BZ$25.00"));
}

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let addr = start_test_server().await;
    let a = connect(addr, "wire_tenant_a").await;
    let b = connect(addr, "wire_tenant_b").await;
    let s = setup_salon(&a).await;

    let listing = format!("SELECT * FROM services WHERE business_id = '{}'", s.business);
    assert_eq!(rows(&a, &listing).await.len(), 1);
    assert!(rows(&b, &listing).await.is_empty());

    let err = book(&b, &s, Ulid::new(), &(DAY + 9 * H).to_string())
        .await
        .unwrap_err();
    assert!(err.as_db_error().unwrap().message().contains("not found"));
}

#[tokio::test]
async fn payment_lifecycle_over_wire() {
    let addr = start_test_server().await;
    let client = connect(addr, "wire_payments").await;
    let s = setup_salon(&client).await;
    let appointment = book(&client, &s, Ulid::new(), &(DAY + 11 * H).to_string())
        .await
        .unwrap();

    let payment = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO payments (id, appointment_id, payment_method) VALUES ('{payment}', '{appointment}', 'cash')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "UPDATE payments SET status = 'completed', receipt_url = 'https://r.example/9' WHERE id = '{payment}'"
        ))
        .await
        .unwrap();

    let listed = rows(
        &client,
        &format!("SELECT * FROM payments WHERE appointment_id = '{appointment}'"),
    )
    .await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("amount_cents"), Some("2500"));
    assert_eq!(listed[0].get("amount"), Some("BZ$25.00"));
    assert_eq!(listed[0].get("status"), Some("completed"));
    assert_eq!(listed[0].get("receipt_url"), Some("https://r.example/9"));

    let err = client
        .batch_execute(&format!("UPDATE payments SET status = 'pending' WHERE id = '{payment}'"))
        .await
        .unwrap_err();
    assert_eq!(err.as_db_error().unwrap().code().code(), "P0001");
}

#[tokio::test]
async fn unassign_and_edit_over_wire() {
    let addr = start_test_server().await;
    let client = connect(addr, "wire_edits").await;
    let s = setup_salon(&client).await;
    let start = DAY + 14 * H;
    let id = book(&client, &s, Ulid::new(), &start.to_string()).await.unwrap();

    client
        .batch_execute(&format!(
            "UPDATE appointments SET start = {start}, staff_id = NULL WHERE id = '{id}'"
        ))
        .await
        .unwrap();
    let moved = rows(&client, &format!("SELECT * FROM appointments WHERE id = '{id}'")).await;
    assert_eq!(moved[0].get("staff_id"), None);

    client
        .batch_execute(&format!(
            "UPDATE services SET price = 30, name = 'Cut & Style' WHERE id = '{}'",
            s.service
        ))
        .await
        .unwrap();
    let services = rows(
        &client,
        &format!("SELECT * FROM services WHERE business_id = '{}'", s.business),
    )
    .await;
    assert_eq!(services[0].get("name"), Some("Cut & Style"));
    assert_eq!(services[0].get("price"), Some("BZ$30.00"));

    let err = client
        .batch_execute(&format!(
            "UPDATE services SET price = '-0.50' WHERE id = '{}'",
            s.service
        ))
        .await
        .unwrap_err();
    assert_eq!(err.as_db_error().unwrap().code().code(), "42601");
}

#[tokio::test]
async fn malformed_sql_is_a_syntax_error() {
    let addr = start_test_server().await;
    let client = connect(addr, "wire_syntax").await;

    let err = client
        .simple_query("SELECT * FROM invoices WHERE id = '1'")
        .await
        .unwrap_err();
    assert_eq!(err.as_db_error().unwrap().code().code(), "42601");
}
