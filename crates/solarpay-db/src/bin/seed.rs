//! # Seed Data Generator
//!
//! Populates the database with demo sales for development.
//!
//! ## Usage
//! ```bash
//! # Generate 20 sales (default)
//! cargo run -p solarpay-db --bin seed
//!
//! # Generate custom amount
//! cargo run -p solarpay-db --bin seed -- --count 200
//!
//! # Specify database path
//! cargo run -p solarpay-db --bin seed -- --db ./data/solarpay.db
//! ```
//!
//! ## Generated Data
//! - One agent wallet (`agent-demo`) credited with NGN 500,000.00
//! - One inventory batch per product
//! - Per sale: a customer, one device per unit, one line item and a stock
//!   allocation. Every third sale is ONE_OFF; the rest are 12, 18 or 24
//!   month installment plans.

use chrono::Utc;
use solarpay_core::{
    new_id, CustomerContact, Device, InstallmentAccountDetails, LedgerEntryKind, Money,
    PaymentMethod, PaymentMode, Sale, SaleLineItem, SaleStatus,
};
use solarpay_db::{Database, DbConfig, LedgerEntry};
use std::env;

/// Products on sale: (product id, hardware model, cash price in naira).
const PRODUCTS: &[(&str, &str, i64)] = &[
    ("shs-80", "SHS-80", 96_000),
    ("shs-120", "SHS-120", 144_000),
    ("shs-200", "SHS-200", 240_000),
];

const FIRST_NAMES: &[&str] = &[
    "Ada", "Chinedu", "Funke", "Ibrahim", "Ngozi", "Tunde", "Zainab", "Emeka", "Bisi", "Musa",
];

const PLAN_MONTHS: &[u32] = &[12, 18, 24];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut count: usize = 20;
    let mut db_path = String::from("./solarpay_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(20);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Solarpay Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>    Number of sales to generate (default: 20)");
                println!("  -d, --db <PATH>    Database file path (default: ./solarpay_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("🌱 Solarpay Seed Data Generator");
    println!("===============================");
    println!("Database: {}", db_path);
    println!("Sales:    {}", count);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;

    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    let now = Utc::now();

    if db.wallets().get_by_agent("agent-demo").await?.is_some() {
        println!("⚠ Demo data already present");
        println!("  Delete the database file to regenerate.");
        return Ok(());
    }

    db.wallets().create("agent-demo", now).await?;
    db.wallets()
        .apply_entry(
            &LedgerEntry {
                agent_id: "agent-demo".into(),
                kind: LedgerEntryKind::Credit,
                amount: Money::from_major(500_000),
                reference: "SEED-OPENING-BALANCE".into(),
                description: "Opening balance".into(),
                payment_id: None,
            },
            now,
        )
        .await?;
    println!("✓ Wallet agent-demo credited with {}", Money::from_major(500_000));

    let mut batches = Vec::with_capacity(PRODUCTS.len());
    for (product_id, _, _) in PRODUCTS {
        batches.push(db.inventory().insert_batch(product_id, 10_000, now).await?);
    }
    println!("✓ Inventory batches created");

    println!();
    println!("Generating sales...");

    let start = std::time::Instant::now();
    let mut generated = 0;

    for seed in 0..count {
        let (product_id, model, price) = PRODUCTS[seed % PRODUCTS.len()];
        let batch = &batches[seed % PRODUCTS.len()];
        let name = FIRST_NAMES[seed % FIRST_NAMES.len()];
        let units: u32 = if seed % 5 == 0 { 2 } else { 1 };

        let customer = CustomerContact {
            customer_id: new_id(),
            name: format!("{} Customer{:03}", name, seed),
            email: Some(format!("customer{:03}@example.com", seed)),
            phone: Some(format!("0803{:07}", seed)),
        };
        db.sales().insert_customer(&customer, now).await?;

        let mut device_ids = Vec::new();
        for unit in 0..units {
            let device = Device {
                id: new_id(),
                serial_number: format!("{}-{:05}-{}", model, seed, unit),
                key: format!("{:032x}", (seed as u128 + 1) * 0x9e37_79b9_7f4a_7c15 + u128::from(unit)),
                starting_code: Some(format!("{:09}", (seed * 7919) % 1_000_000_000)),
                time_divider: Some("1".into()),
                restricted_digit_mode: false,
                count: 0,
                is_tokenable: true,
                hardware_model: Some(model.to_string()),
                firmware_version: Some("2.1.0".into()),
                created_at: now,
                updated_at: now,
            };
            db.devices().insert(&device).await?;
            device_ids.push(device.id);
        }

        let total_price = Money::from_major(price * i64::from(units));
        let (mode, months) = if seed % 3 == 0 {
            (PaymentMode::OneOff, 0)
        } else {
            (PaymentMode::Installment, PLAN_MONTHS[seed % PLAN_MONTHS.len()])
        };
        let monthly = if months == 0 {
            Money::zero()
        } else {
            Money::from_minor(total_price.minor() / i64::from(months))
        };

        let sale = Sale {
            id: new_id(),
            customer_id: customer.customer_id.clone(),
            agent_id: Some("agent-demo".into()),
            status: SaleStatus::Unpaid,
            payment_mode: mode,
            payment_method: PaymentMethod::Online,
            total_price,
            total_paid: Money::zero(),
            total_monthly_payment: monthly,
            installment_starting_price: monthly,
            total_installment_duration: months,
            remaining_installments: months,
            total_miscellaneous_price: Money::zero(),
            account_details: (mode == PaymentMode::Installment).then(|| InstallmentAccountDetails {
                bank_name: "Wema Bank".into(),
                account_name: customer.name.clone(),
                account_number: format!("{:010}", 7_000_000_000u64 + seed as u64),
            }),
            delivered_account_details: false,
            created_at: now,
            updated_at: now,
        };

        let item = SaleLineItem {
            id: new_id(),
            sale_id: sale.id.clone(),
            product_id: product_id.to_string(),
            payment_mode: mode,
            quantity: units,
            total_price,
            monthly_payment: monthly,
            installment_starting_price: monthly,
            installment_duration: months,
            device_ids,
        };

        if let Err(e) = db.sales().insert_sale(&sale, &[item]).await {
            eprintln!("Failed to insert sale {}: {}", sale.id, e);
            continue;
        }
        db.inventory().allocate(&sale.id, &batch.id, i64::from(units)).await?;

        generated += 1;
        if generated % 50 == 0 {
            println!("  Generated {} sales...", generated);
        }
    }

    let elapsed = start.elapsed();
    println!();
    println!("✓ Generated {} sales in {:?}", generated, elapsed);

    println!();
    println!("✓ Seed complete!");

    Ok(())
}
