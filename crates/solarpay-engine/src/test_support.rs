//! Scripted gateway, token service and notifier plus seed helpers for the
//! engine's unit tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::FixedClock;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::gateway::{GatewayStatus, OrderHandle, OrderStatus, PaymentGateway};
use crate::notify::Notifier;
use crate::protocol::{IssuedCode, TokenProtocol};
use crate::reconcile::ReconciliationEngine;
use solarpay_core::{
    new_id, CustomerContact, Device, DeviceToken, InstallmentAccountDetails, Money, Payment, PaymentMethod,
    PaymentMode, PaymentStatus, Sale, SaleLineItem, SaleStatus,
};
use solarpay_db::{Database, DbConfig};

pub(crate) fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
}

// =============================================================================
// Fake Gateway
// =============================================================================

/// Gateway whose order statuses are set by the test.
///
/// Orders are referenced as `OREF-{reference}`; statuses are keyed by the
/// plain reference. Unknown references report PENDING.
#[derive(Default)]
pub(crate) struct FakeGateway {
    statuses: Mutex<HashMap<String, OrderStatus>>,
    pub orders: Mutex<Vec<(String, Money, String, String)>>,
    pub status_checks: AtomicUsize,
    pub unreachable: AtomicBool,
    pub reject_orders: AtomicBool,
}

impl FakeGateway {
    pub fn set_status(&self, reference: &str, status: OrderStatus) {
        self.statuses.lock().unwrap().insert(reference.to_string(), status);
    }

    pub fn checks(&self) -> usize {
        self.status_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_order(
        &self,
        amount: Money,
        phone: &str,
        description: &str,
        reference: &str,
    ) -> EngineResult<OrderHandle> {
        if self.reject_orders.load(Ordering::SeqCst) {
            return Err(EngineError::GatewayRejected {
                status: 400,
                message: "invalid msisdn".into(),
            });
        }

        self.orders
            .lock()
            .unwrap()
            .push((reference.to_string(), amount, phone.to_string(), description.to_string()));

        Ok(OrderHandle {
            order_id: format!("ORD-{}", reference),
            order_reference: format!("OREF-{}", reference),
            sms_number: Some("*389*7#".into()),
            message: Some(format!("Dial to pay {}", amount)),
        })
    }

    async fn check_status(&self, order_reference: &str) -> EngineResult<GatewayStatus> {
        self.status_checks.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(EngineError::GatewayTimeout(10));
        }

        let key = order_reference.trim_start_matches("OREF-");
        let status = self
            .statuses
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or(OrderStatus::Pending);

        Ok(GatewayStatus {
            status,
            raw: json!({ "status": status.to_string(), "order_reference": order_reference }),
        })
    }
}

// =============================================================================
// Fake Token Service
// =============================================================================

/// Token service returning `{serial}-{counter}` and advancing by one.
#[derive(Default)]
pub(crate) struct FakeTokenProtocol {
    failing: Mutex<HashSet<String>>,
    pub calls: AtomicUsize,
}

impl FakeTokenProtocol {
    pub fn fail_device(&self, device_id: &str) {
        self.failing.lock().unwrap().insert(device_id.to_string());
    }

    pub fn heal_device(&self, device_id: &str) {
        self.failing.lock().unwrap().remove(device_id);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProtocol for FakeTokenProtocol {
    async fn generate_token(&self, device: &Device, _duration_days: i64, counter: i64) -> EngineResult<IssuedCode> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        if self.failing.lock().unwrap().contains(&device.id) {
            return Err(EngineError::TokenProtocol {
                device_id: device.id.clone(),
                message: "token service unavailable".into(),
            });
        }

        Ok(IssuedCode {
            token: format!("{}-{}", device.serial_number, counter),
            new_count: counter + 1,
        })
    }
}

// =============================================================================
// Recording Notifier
// =============================================================================

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    pub tokens_sent: Mutex<Vec<(String, Vec<DeviceToken>)>>,
    pub details_sent: Mutex<Vec<(String, InstallmentAccountDetails)>>,
    pub fail_details: AtomicBool,
}

impl RecordingNotifier {
    pub fn details_count(&self) -> usize {
        self.details_sent.lock().unwrap().len()
    }

    pub fn token_messages(&self) -> usize {
        self.tokens_sent.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_tokens(&self, contact: &CustomerContact, tokens: &[DeviceToken]) -> EngineResult<()> {
        self.tokens_sent
            .lock()
            .unwrap()
            .push((contact.customer_id.clone(), tokens.to_vec()));
        Ok(())
    }

    async fn send_account_details(
        &self,
        contact: &CustomerContact,
        details: &InstallmentAccountDetails,
    ) -> EngineResult<()> {
        if self.fail_details.load(Ordering::SeqCst) {
            return Err(EngineError::Internal("sms channel down".into()));
        }
        self.details_sent
            .lock()
            .unwrap()
            .push((contact.customer_id.clone(), details.clone()));
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

pub(crate) struct Harness {
    pub db: Database,
    pub clock: Arc<FixedClock>,
    pub gateway: Arc<FakeGateway>,
    pub protocol: Arc<FakeTokenProtocol>,
    pub notifier: Arc<RecordingNotifier>,
    pub config: EngineConfig,
    pub engine: Arc<ReconciliationEngine>,
}

/// In-memory database, fakes on every seam, no retry backoff.
pub(crate) async fn harness() -> Harness {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    let clock = Arc::new(FixedClock::new(start_time()));
    let gateway = Arc::new(FakeGateway::default());
    let protocol = Arc::new(FakeTokenProtocol::default());
    let notifier = Arc::new(RecordingNotifier::default());

    let mut config = EngineConfig::default();
    config.retry.max_attempts = 1;
    config.retry.initial_backoff_ms = 0;
    config.poller.spacing_ms = 0;

    let engine = Arc::new(ReconciliationEngine::assemble(
        db.clone(),
        &config,
        gateway.clone(),
        protocol.clone(),
        notifier.clone(),
        clock.clone(),
    ));

    Harness {
        db,
        clock,
        gateway,
        protocol,
        notifier,
        config,
        engine,
    }
}

// =============================================================================
// Seeds
// =============================================================================

/// Shape of a seeded sale.
#[derive(Debug, Clone)]
pub(crate) struct SalePlan {
    pub mode: PaymentMode,
    pub method: PaymentMethod,
    pub total: i64,
    pub monthly: i64,
    pub duration: u32,
    pub fees: i64,
    pub devices: usize,
    pub agent_id: Option<String>,
}

impl SalePlan {
    /// 144_000 over 24 months at 6_000, paid online.
    pub fn installment(devices: usize) -> Self {
        SalePlan {
            mode: PaymentMode::Installment,
            method: PaymentMethod::Online,
            total: 144_000,
            monthly: 6_000,
            duration: 24,
            fees: 0,
            devices,
            agent_id: None,
        }
    }

    /// 50_000 paid in one go.
    pub fn one_off(devices: usize) -> Self {
        SalePlan {
            mode: PaymentMode::OneOff,
            method: PaymentMethod::Online,
            total: 50_000,
            monthly: 0,
            duration: 0,
            fees: 0,
            devices,
            agent_id: None,
        }
    }

    pub fn paid_by(mut self, method: PaymentMethod, agent_id: Option<&str>) -> Self {
        self.method = method;
        self.agent_id = agent_id.map(str::to_string);
        self
    }
}

pub(crate) fn sample_device(serial: &str, now: DateTime<Utc>) -> Device {
    Device {
        id: new_id(),
        serial_number: serial.to_string(),
        key: "a1b2c3d4e5f60718".into(),
        starting_code: Some("123456789".into()),
        time_divider: Some("1".into()),
        restricted_digit_mode: false,
        count: 0,
        is_tokenable: true,
        hardware_model: Some("SHS-80".into()),
        firmware_version: None,
        created_at: now,
        updated_at: now,
    }
}

/// Inserts customer, devices and sale. Fees count as already paid.
pub(crate) async fn seed_sale(db: &Database, now: DateTime<Utc>, plan: SalePlan) -> (Sale, Vec<Device>) {
    let customer_id = new_id();
    db.sales()
        .insert_customer(
            &CustomerContact {
                customer_id: customer_id.clone(),
                name: "Ada Obi".into(),
                email: Some("ada@example.com".into()),
                phone: Some("08031234567".into()),
            },
            now,
        )
        .await
        .unwrap();

    let mut devices = Vec::new();
    for i in 0..plan.devices {
        let device = sample_device(&format!("SHS-80-{}-{}", &new_id()[..8], i + 1), now);
        db.devices().insert(&device).await.unwrap();
        devices.push(device);
    }

    let sale = Sale {
        id: new_id(),
        customer_id,
        agent_id: plan.agent_id.clone(),
        status: SaleStatus::Unpaid,
        payment_mode: plan.mode,
        payment_method: plan.method,
        total_price: Money::from_major(plan.total),
        total_paid: Money::from_major(plan.fees),
        total_monthly_payment: Money::from_major(plan.monthly),
        installment_starting_price: Money::from_major(plan.monthly),
        total_installment_duration: plan.duration,
        remaining_installments: plan.duration,
        total_miscellaneous_price: Money::from_major(plan.fees),
        account_details: match plan.mode {
            PaymentMode::Installment => Some(InstallmentAccountDetails {
                bank_name: "Wema Bank".into(),
                account_name: "Ada Obi".into(),
                account_number: "7000000001".into(),
            }),
            PaymentMode::OneOff => None,
        },
        delivered_account_details: false,
        created_at: now,
        updated_at: now,
    };

    let items = if devices.is_empty() {
        Vec::new()
    } else {
        vec![SaleLineItem {
            id: new_id(),
            sale_id: sale.id.clone(),
            product_id: "prod-shs-80".into(),
            payment_mode: plan.mode,
            quantity: u32::try_from(devices.len()).unwrap(),
            total_price: Money::from_major(plan.total),
            monthly_payment: Money::from_major(plan.monthly),
            installment_starting_price: Money::from_major(plan.monthly),
            installment_duration: plan.duration,
            device_ids: devices.iter().map(|d| d.id.clone()).collect(),
        }]
    };
    db.sales().insert_sale(&sale, &items).await.unwrap();

    (sale, devices)
}

/// Inserts a PENDING payment without going through the gateway.
pub(crate) async fn seed_payment(
    db: &Database,
    sale: &Sale,
    amount: i64,
    method: PaymentMethod,
    now: DateTime<Utc>,
) -> Payment {
    let payment = Payment {
        id: new_id(),
        sale_id: sale.id.clone(),
        amount: Money::from_major(amount),
        transaction_ref: format!("SP-{}", new_id()),
        method,
        status: PaymentStatus::Pending,
        agent_id: sale.agent_id.clone(),
        gateway_order_id: None,
        gateway_order_ref: None,
        sms_number: None,
        sms_message: None,
        months_covered: None,
        tokens_settled_at: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
    };
    db.payments().insert(&payment).await.unwrap();
    payment
}
