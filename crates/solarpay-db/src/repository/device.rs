//! # Device Repository
//!
//! Devices, their protocol counters, and the tokens issued to them.
//!
//! The counter is the one piece of device state the issuance path writes.
//! [`record_issued_token`](DeviceRepository::record_issued_token) advances it
//! with a compare-and-set so two issuers can never both claim the same step.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::error::{DbError, DbResult};
use solarpay_core::{new_id, Device, PaymentMode, Token};

/// A device attached to a sale line, with the line's payment mode.
#[derive(Debug, Clone)]
pub struct TokenableDevice {
    pub line_item_id: String,
    pub payment_mode: PaymentMode,
    pub device: Device,
}

#[derive(Debug, sqlx::FromRow)]
struct DeviceRow {
    id: String,
    serial_number: String,
    device_key: String,
    starting_code: Option<String>,
    time_divider: Option<String>,
    restricted_digit_mode: bool,
    count: i64,
    is_tokenable: bool,
    hardware_model: Option<String>,
    firmware_version: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        Device {
            id: row.id,
            serial_number: row.serial_number,
            key: row.device_key,
            starting_code: row.starting_code,
            time_divider: row.time_divider,
            restricted_digit_mode: row.restricted_digit_mode,
            count: row.count,
            is_tokenable: row.is_tokenable,
            hardware_model: row.hardware_model,
            firmware_version: row.firmware_version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LinkedDeviceRow {
    line_item_id: String,
    payment_mode: PaymentMode,
    #[sqlx(flatten)]
    device: DeviceRow,
}

#[derive(Debug, sqlx::FromRow)]
struct TokenRow {
    id: String,
    device_id: String,
    value: String,
    duration_days: i64,
    payment_id: Option<String>,
    issued_at: DateTime<Utc>,
}

impl From<TokenRow> for Token {
    fn from(row: TokenRow) -> Self {
        Token {
            id: row.id,
            device_id: row.device_id,
            value: row.value,
            duration_days: row.duration_days,
            payment_id: row.payment_id,
            issued_at: row.issued_at,
        }
    }
}

const DEVICE_COLUMNS: &str = r#"
    d.id, d.serial_number, d.device_key, d.starting_code, d.time_divider,
    d.restricted_digit_mode, d.count, d.is_tokenable, d.hardware_model,
    d.firmware_version, d.created_at, d.updated_at
"#;

/// Repository for device and token database operations.
#[derive(Debug, Clone)]
pub struct DeviceRepository {
    pool: SqlitePool,
}

impl DeviceRepository {
    /// Creates a new DeviceRepository.
    pub fn new(pool: SqlitePool) -> Self {
        DeviceRepository { pool }
    }

    /// Registers a device.
    pub async fn insert(&self, device: &Device) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (
                id, serial_number, device_key, starting_code, time_divider,
                restricted_digit_mode, count, is_tokenable, hardware_model,
                firmware_version, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(&device.id)
        .bind(&device.serial_number)
        .bind(&device.key)
        .bind(&device.starting_code)
        .bind(&device.time_divider)
        .bind(device.restricted_digit_mode)
        .bind(device.count)
        .bind(device.is_tokenable)
        .bind(&device.hardware_model)
        .bind(&device.firmware_version)
        .bind(device.created_at)
        .bind(device.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => {
                DbError::duplicate(field, device.serial_number.clone())
            }
            other => other,
        })?;

        Ok(())
    }

    /// Gets a device by ID.
    pub async fn get(&self, id: &str) -> DbResult<Option<Device>> {
        let row: Option<DeviceRow> =
            sqlx::query_as(&format!("SELECT {DEVICE_COLUMNS} FROM devices d WHERE d.id = ?1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Device::from))
    }

    /// Tokenable devices attached to a sale, in line-item order.
    pub async fn tokenable_for_sale(&self, sale_id: &str) -> DbResult<Vec<TokenableDevice>> {
        let rows: Vec<LinkedDeviceRow> = sqlx::query_as(&format!(
            r#"
            SELECT si.id AS line_item_id, si.payment_mode, {DEVICE_COLUMNS}
            FROM sale_items si
            INNER JOIN sale_item_devices sid ON sid.sale_item_id = si.id
            INNER JOIN devices d ON d.id = sid.device_id
            WHERE si.sale_id = ?1 AND d.is_tokenable = 1
            ORDER BY si.rowid, sid.rowid
            "#
        ))
        .bind(sale_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| TokenableDevice {
                line_item_id: row.line_item_id,
                payment_mode: row.payment_mode,
                device: Device::from(row.device),
            })
            .collect())
    }

    /// Advances the device counter and stores the token in one transaction.
    ///
    /// ## Returns
    /// * `Ok(Some(token))` - counter moved from `expected_count` to `new_count`
    /// * `Ok(None)` - the counter was no longer `expected_count`; nothing stored
    #[allow(clippy::too_many_arguments)]
    pub async fn record_issued_token(
        &self,
        device_id: &str,
        expected_count: i64,
        new_count: i64,
        value: &str,
        duration_days: i64,
        payment_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> DbResult<Option<Token>> {
        if new_count <= expected_count {
            return Err(DbError::Internal(format!(
                "device {device_id} counter must advance: {expected_count} -> {new_count}"
            )));
        }

        let mut tx = self.pool.begin().await?;

        let advanced = sqlx::query(
            "UPDATE devices SET count = ?3, updated_at = ?4 WHERE id = ?1 AND count = ?2",
        )
        .bind(device_id)
        .bind(expected_count)
        .bind(new_count)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if advanced == 0 {
            tx.rollback().await?;
            warn!(device_id = %device_id, expected_count, "Device counter moved, token discarded");
            return Ok(None);
        }

        let token = Token {
            id: new_id(),
            device_id: device_id.to_string(),
            value: value.to_string(),
            duration_days,
            payment_id: payment_id.map(str::to_string),
            issued_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO tokens (id, device_id, value, duration_days, payment_id, issued_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&token.id)
        .bind(&token.device_id)
        .bind(&token.value)
        .bind(token.duration_days)
        .bind(&token.payment_id)
        .bind(token.issued_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(device_id = %device_id, new_count, "Token recorded");
        Ok(Some(token))
    }

    /// Tokens paid for by one payment.
    pub async fn tokens_for_payment(&self, payment_id: &str) -> DbResult<Vec<Token>> {
        let rows: Vec<TokenRow> = sqlx::query_as(
            r#"
            SELECT id, device_id, value, duration_days, payment_id, issued_at
            FROM tokens
            WHERE payment_id = ?1
            ORDER BY issued_at, rowid
            "#,
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Token::from).collect())
    }

    /// Every token a device has received, oldest first.
    pub async fn tokens_for_device(&self, device_id: &str) -> DbResult<Vec<Token>> {
        let rows: Vec<TokenRow> = sqlx::query_as(
            r#"
            SELECT id, device_id, value, duration_days, payment_id, issued_at
            FROM tokens
            WHERE device_id = ?1
            ORDER BY issued_at, rowid
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Token::from).collect())
    }

    /// Enables or disables token issuance for a device.
    pub async fn set_tokenable(&self, device_id: &str, tokenable: bool, now: DateTime<Utc>) -> DbResult<()> {
        let updated = sqlx::query("UPDATE devices SET is_tokenable = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(device_id)
            .bind(tokenable)
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated == 0 {
            return Err(DbError::not_found("Device", device_id));
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::{sample_device, seed_sale_with_devices};
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_counter_compare_and_set() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();
        let device = sample_device("SN-001", now);
        db.devices().insert(&device).await.unwrap();

        let token = db
            .devices()
            .record_issued_token(&device.id, 0, 1, "123 456 789", 30, None, now)
            .await
            .unwrap();
        assert!(token.is_some());

        // Stale expected count loses
        let stale = db
            .devices()
            .record_issued_token(&device.id, 0, 1, "999 999 999", 30, None, now)
            .await
            .unwrap();
        assert!(stale.is_none());

        let stored = db.devices().get(&device.id).await.unwrap().unwrap();
        assert_eq!(stored.count, 1);
        assert_eq!(db.devices().tokens_for_device(&device.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_counter_must_advance() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();
        let device = sample_device("SN-002", now);
        db.devices().insert(&device).await.unwrap();

        let err = db
            .devices()
            .record_issued_token(&device.id, 3, 3, "x", 30, None, now)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Internal(_)));
    }

    #[tokio::test]
    async fn test_tokenable_for_sale_skips_disabled() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();

        let on = sample_device("SN-ON", now);
        let off = sample_device("SN-OFF", now);
        db.devices().insert(&on).await.unwrap();
        db.devices().insert(&off).await.unwrap();
        db.devices().set_tokenable(&off.id, false, now).await.unwrap();

        let sale = seed_sale_with_devices(&db, now, &[&on.id, &off.id]).await;

        let devices = db.devices().tokenable_for_sale(&sale.id).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device.serial_number, "SN-ON");
        assert_eq!(devices[0].payment_mode, PaymentMode::Installment);
    }
}
