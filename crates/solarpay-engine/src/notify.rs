//! # Customer Notifications
//!
//! Delivery channels (SMS, e-mail) live outside the engine. The engine
//! formats the message bodies and hands them to a [`Notifier`].

use async_trait::async_trait;
use tracing::info;

use crate::error::EngineResult;
use solarpay_core::{CustomerContact, DeviceToken, InstallmentAccountDetails};

/// Outbound customer messaging.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends freshly issued device tokens to the customer.
    async fn send_tokens(&self, contact: &CustomerContact, tokens: &[DeviceToken]) -> EngineResult<()>;

    /// Sends the bank account used for monthly installments.
    async fn send_account_details(
        &self,
        contact: &CustomerContact,
        details: &InstallmentAccountDetails,
    ) -> EngineResult<()>;
}

/// Notifier that writes every message to the log instead of delivering it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send_tokens(&self, contact: &CustomerContact, tokens: &[DeviceToken]) -> EngineResult<()> {
        let body = format_tokens_message(tokens, Some(contact.name.as_str()));
        info!(
            customer_id = %contact.customer_id,
            phone = contact.phone.as_deref().unwrap_or("-"),
            email = contact.email.as_deref().unwrap_or("-"),
            token_count = tokens.len(),
            %body,
            "Device tokens notification"
        );
        Ok(())
    }

    async fn send_account_details(
        &self,
        contact: &CustomerContact,
        details: &InstallmentAccountDetails,
    ) -> EngineResult<()> {
        let body = format_account_details_message(details, Some(contact.name.as_str()));
        info!(
            customer_id = %contact.customer_id,
            phone = contact.phone.as_deref().unwrap_or("-"),
            %body,
            "Installment account details notification"
        );
        Ok(())
    }
}

// =============================================================================
// Message Formatting
// =============================================================================

fn greeting(customer_name: Option<&str>) -> String {
    match customer_name.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => format!("Dear {},", name),
        None => "Dear Customer,".to_string(),
    }
}

/// Body of the installment account-details message.
pub fn format_account_details_message(details: &InstallmentAccountDetails, customer_name: Option<&str>) -> String {
    let mut message = format!("{}\n\nYour installment payment details:\n\n", greeting(customer_name));
    message.push_str(&format!("Bank: {}\n", details.bank_name));
    message.push_str(&format!("Account: {}\n", details.account_number));
    message.push_str(&format!("Name: {}\n\n", details.account_name));
    message.push_str("Use these details for monthly payments.\n\nThank you!");
    message
}

/// Body of the device-tokens message, one line per device.
pub fn format_tokens_message(tokens: &[DeviceToken], customer_name: Option<&str>) -> String {
    let mut message = format!("{}\n\nYour device tokens:\n\n", greeting(customer_name));
    for token in tokens {
        let validity = if token.duration_days < 0 {
            "forever".to_string()
        } else {
            format!("{} days", token.duration_days)
        };
        message.push_str(&format!("{}: {} ({})\n", token.serial_number, token.token, validity));
    }
    message.push_str("\nThank you!");
    message
}
