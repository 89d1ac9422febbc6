//! Common test utilities for weighbridge-service integration tests.
//!
//! Tests need a Postgres database in `TEST_DATABASE_URL`. Every spawned app seeds its own
//! branch so tests never share rows.

#![allow(dead_code)]

use rand::{distributions::Alphanumeric, Rng};
use reqwest::{Client, Response};
use secrecy::Secret;
use serde_json::Value;
use service_core::config::Config as CommonConfig;
use sqlx::PgPool;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Once;
use std::time::Duration;
use uuid::Uuid;
use weighbridge_service::config::{DatabaseConfig, RateLimitConfig, ReportConfig, WeighbridgeConfig};
use weighbridge_service::services::reports::ReportColumnOverrides;
use weighbridge_service::startup::Application;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,weighbridge_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn test_database_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set to a disposable Postgres database")
}

pub fn test_config(database_url: String, rate_limit_per_minute: u64) -> WeighbridgeConfig {
    WeighbridgeConfig {
        common: CommonConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            request_timeout_secs: 30,
        },
        service_name: "weighbridge-service-test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: Secret::new(database_url),
            max_connections: 10,
            min_connections: 1,
        },
        rate_limit: RateLimitConfig {
            redis_url: None,
            per_minute: rate_limit_per_minute,
        },
        report: ReportConfig {
            schema_version: 1,
            columns: ReportColumnOverrides::default(),
        },
    }
}

/// Rows seeded for one test branch.
#[derive(Debug, Clone)]
pub struct Seed {
    pub branch_id: Uuid,
    pub branch_code: String,
    pub operator_id: Uuid,
    pub other_operator_id: Uuid,
    pub manager_id: Uuid,
    pub client_id: Uuid,
    pub vehicle_id: Uuid,
}

/// Default tier of every seeded branch: 50 per weighing, 0.5 per kg, minimum 100.
pub const TIER_PER_WEIGHING: f64 = 50.0;
pub const TIER_PER_KG: f64 = 0.5;
pub const TIER_MINIMUM: f64 = 100.0;
pub const BRANCH_TAX_RATE: f64 = 12.0;

/// Test application wrapper.
pub struct TestApp {
    pub address: String,
    pub port: u16,
    pub pool: PgPool,
    pub client: Client,
    pub seed: Seed,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with_rate_limit(0).await
    }

    pub async fn spawn_with_rate_limit(per_minute: u64) -> Self {
        init_tracing();
        let database_url = test_database_url();

        let app = Application::build(test_config(database_url, per_minute))
            .await
            .expect("Failed to build application");

        let port = app.port();
        let pool = app.db().pool().clone();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        // Wait for server to be ready with retry
        let mut attempts = 0;
        loop {
            match client.get(format!("{}/health", address)).send().await {
                Ok(_) => break,
                Err(_) if attempts < 20 => {
                    attempts += 1;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => panic!("Server did not come up after 20 attempts: {}", e),
            }
        }

        let seed = seed_branch(&pool).await;
        Self {
            address,
            port,
            pool,
            client,
            seed,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    fn as_user(&self, builder: reqwest::RequestBuilder, user_id: Uuid, role: &str) -> reqwest::RequestBuilder {
        builder
            .header("X-User-ID", user_id.to_string())
            .header("X-User-Role", role)
            .header("X-Branch-ID", self.seed.branch_id.to_string())
    }

    pub fn create_body(&self, first_weight: f64) -> Value {
        serde_json::json!({
            "client_id": self.seed.client_id,
            "vehicle_id": self.seed.vehicle_id,
            "transaction_type": "inbound",
            "first_weight": first_weight,
            "material_type": "gravel",
        })
    }

    pub async fn create_transaction(&self, key: &str, body: &Value) -> Response {
        self.as_user(
            self.client.post(self.url("/api/transactions")),
            self.seed.operator_id,
            "operator",
        )
        .header("Idempotency-Key", key)
        .json(body)
        .send()
        .await
        .expect("Failed to execute request")
    }

    pub async fn complete_transaction_as(
        &self,
        id: &str,
        second_weight: f64,
        user_id: Uuid,
        role: &str,
    ) -> Response {
        self.as_user(
            self.client
                .post(self.url(&format!("/api/transactions/{}/complete", id))),
            user_id,
            role,
        )
        .header("Idempotency-Key", format!("complete-{}-{}", id, second_weight))
        .json(&serde_json::json!({ "second_weight": second_weight }))
        .send()
        .await
        .expect("Failed to execute request")
    }

    pub async fn complete_transaction(&self, id: &str, second_weight: f64) -> Response {
        self.complete_transaction_as(id, second_weight, self.seed.operator_id, "operator")
            .await
    }

    pub async fn get_as_manager(&self, path: &str) -> Response {
        self.as_user(self.client.get(self.url(path)), self.seed.manager_id, "manager")
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn post_as_manager(&self, path: &str) -> Response {
        self.as_user(self.client.post(self.url(path)), self.seed.manager_id, "manager")
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn post_webhook(&self, body: &Value) -> Response {
        self.client
            .post(self.url("/api/webhooks/payments"))
            .json(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Create and complete a weighing, returning the completion `data`.
    pub async fn completed_weighing(&self, first: f64, second: f64) -> Value {
        let key = Uuid::new_v4().to_string();
        let created: Value = self
            .create_transaction(&key, &self.create_body(first))
            .await
            .json()
            .await
            .expect("Failed to parse JSON");
        let id = created["data"]["id"].as_str().expect("missing id").to_string();

        let completed: Value = self
            .complete_transaction(&id, second)
            .await
            .json()
            .await
            .expect("Failed to parse JSON");
        assert_eq!(completed["success"], true, "{completed}");
        completed["data"].clone()
    }

    pub async fn count(&self, sql: &str, id: Uuid) -> i64 {
        sqlx::query_scalar(sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .expect("Failed to count rows")
    }
}

fn random_code() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|b| (b as char).to_ascii_uppercase())
        .collect();
    format!("T{}", suffix)
}

async fn seed_branch(pool: &PgPool) -> Seed {
    let seed = Seed {
        branch_id: Uuid::new_v4(),
        branch_code: random_code(),
        operator_id: Uuid::new_v4(),
        other_operator_id: Uuid::new_v4(),
        manager_id: Uuid::new_v4(),
        client_id: Uuid::new_v4(),
        vehicle_id: Uuid::new_v4(),
    };

    sqlx::query("INSERT INTO branches (id, code, name, tax_rate) VALUES ($1, $2, $3, $4)")
        .bind(seed.branch_id)
        .bind(&seed.branch_code)
        .bind(format!("Branch {}", seed.branch_code))
        .bind(BRANCH_TAX_RATE)
        .execute(pool)
        .await
        .expect("Failed to seed branch");

    for (id, role) in [
        (seed.operator_id, "operator"),
        (seed.other_operator_id, "operator"),
        (seed.manager_id, "manager"),
    ] {
        sqlx::query("INSERT INTO users (id, branch_id, role, name) VALUES ($1, $2, $3, $4)")
            .bind(id)
            .bind(seed.branch_id)
            .bind(role)
            .bind(format!("{} {}", role, id))
            .execute(pool)
            .await
            .expect("Failed to seed user");
    }

    sqlx::query("INSERT INTO clients (id, branch_id, name) VALUES ($1, $2, 'Acme Aggregates')")
        .bind(seed.client_id)
        .bind(seed.branch_id)
        .execute(pool)
        .await
        .expect("Failed to seed client");

    sqlx::query("INSERT INTO vehicles (id, client_id, plate_number) VALUES ($1, $2, 'ABC-1234')")
        .bind(seed.vehicle_id)
        .bind(seed.client_id)
        .execute(pool)
        .await
        .expect("Failed to seed vehicle");

    sqlx::query(
        r#"
        INSERT INTO pricing_tiers (id, branch_id, name, price_per_weighing, price_per_kg, minimum_charge, is_default, is_active)
        VALUES ($1, $2, 'Standard', $3, $4, $5, TRUE, TRUE)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(seed.branch_id)
    .bind(TIER_PER_WEIGHING)
    .bind(TIER_PER_KG)
    .bind(TIER_MINIMUM)
    .execute(pool)
    .await
    .expect("Failed to seed pricing tier");

    seed
}

/// Add an active override for the seeded client.
pub async fn seed_client_override(
    pool: &PgPool,
    seed: &Seed,
    price_per_kg: Option<f64>,
    discount_percentage: Option<f64>,
) {
    sqlx::query(
        r#"
        INSERT INTO client_pricing (id, branch_id, client_id, price_per_kg, discount_percentage, effective_from)
        VALUES ($1, $2, $3, $4, $5, NOW() - INTERVAL '1 day')
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(seed.branch_id)
    .bind(seed.client_id)
    .bind(price_per_kg)
    .bind(discount_percentage)
    .execute(pool)
    .await
    .expect("Failed to seed client pricing");
}
