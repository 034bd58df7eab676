use storefront_api::{
    db::{create_pool, run_migrations},
    services::auth_service::hash_password,
};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL is not set"))?;

    let pool = create_pool(&database_url).await?;
    run_migrations(&pool).await?;

    let admin_id = ensure_user(&pool, "admin@example.com", "Admin", "admin12345", "admin").await?;
    let user_id = ensure_user(&pool, "user@example.com", "Jane Doe", "user12345", "user").await?;
    seed_catalog(&pool).await?;
    seed_coupons(&pool).await?;

    println!("Seed completed. Admin ID: {admin_id}, User ID: {user_id}");
    Ok(())
}

async fn ensure_user(
    pool: &sqlx::PgPool,
    email: &str,
    name: &str,
    password: &str,
    role: &str,
) -> anyhow::Result<Uuid> {
    let password_hash = hash_password(password).map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let (user_id,): (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO users (id, email, name, password_hash, role)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (email) DO UPDATE SET role = EXCLUDED.role, name = EXCLUDED.name
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(email)
    .bind(name)
    .bind(password_hash)
    .bind(role)
    .fetch_one(pool)
    .await?;

    println!("Ensured user {email} (role={role})");
    Ok(user_id)
}

async fn seed_catalog(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    // (product, description, [(sku, attributes, price, stock, discount %, shipping days)])
    let catalog = [
        (
            "Ferris Tee",
            "Cotton tee with Ferris on the front",
            vec![
                ("TEE-RED-M", "red / M", 2500_i64, 40, 10, 3),
                ("TEE-BLK-L", "black / L", 2500, 25, 0, 5),
            ],
        ),
        (
            "Async Mug",
            "Holds coffee while you await",
            vec![("MUG-WHT", "white / 350ml", 1200, 100, 0, 2)],
        ),
        (
            "Crab Hoodie",
            "Warm hoodie for Rustaceans",
            vec![
                ("HOOD-GRY-M", "grey / M", 5500, 15, 20, 7),
                ("HOOD-GRY-XL", "grey / XL", 5500, 5, 20, 7),
            ],
        ),
    ];

    for (name, description, variants) in catalog {
        let (product_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO products (id, name, description)
            VALUES ($1, $2, $3)
            ON CONFLICT (name) DO UPDATE SET description = EXCLUDED.description
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(description)
        .fetch_one(pool)
        .await?;

        for (sku, attributes, price, stock, discount, shipping_days) in variants {
            sqlx::query(
                r#"
                INSERT INTO variants
                    (id, product_id, sku, attributes, price, stock, discount_percent, shipping_time_days)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (sku) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(product_id)
            .bind(sku)
            .bind(attributes)
            .bind(price)
            .bind(stock)
            .bind(discount)
            .bind(shipping_days)
            .execute(pool)
            .await?;
        }
    }

    println!("Seeded products and variants");
    Ok(())
}

async fn seed_coupons(pool: &sqlx::PgPool) -> anyhow::Result<()> {
    let coupons = [("WELCOME10", "percentage", 10_i64), ("FLAT500", "fixed", 500)];

    for (code, discount_type, value) in coupons {
        sqlx::query(
            r#"
            INSERT INTO coupons (id, code, discount_type, discount_value, is_active)
            VALUES ($1, $2, $3, $4, TRUE)
            ON CONFLICT (code) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(code)
        .bind(discount_type)
        .bind(value)
        .execute(pool)
        .await?;
    }

    println!("Seeded coupons");
    Ok(())
}
