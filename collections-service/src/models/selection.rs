//! Payment method selection model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Payment channels a client may declare, each with a fixed early-payment
/// discount percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    BankTransfer,
    CardSingle,
    CardInstallments,
    Checks,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::CardSingle => "card_single",
            PaymentMethod::CardInstallments => "card_installments",
            PaymentMethod::Checks => "checks",
        }
    }

    /// Strict parse: unknown method names are rejected, not defaulted.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bank_transfer" => Some(PaymentMethod::BankTransfer),
            "card_single" => Some(PaymentMethod::CardSingle),
            "card_installments" => Some(PaymentMethod::CardInstallments),
            "checks" => Some(PaymentMethod::Checks),
            _ => None,
        }
    }

    /// Fixed discount table, in whole percent.
    pub fn discount_percent(&self) -> Decimal {
        let pct: i32 = match self {
            PaymentMethod::BankTransfer => 9,
            PaymentMethod::CardSingle => 8,
            PaymentMethod::CardInstallments => 4,
            PaymentMethod::Checks => 0,
        };
        Decimal::from(pct)
    }

    /// `amount × (1 − discount/100)`, rounded to the smallest currency unit.
    pub fn discounted_amount(&self, amount: Decimal) -> Decimal {
        let hundred = Decimal::from(100);
        let factor = (hundred - self.discount_percent()) / hundred;
        (amount * factor).round_dp(2)
    }
}

/// A client's declared intent to pay via a specific channel. One per invoice;
/// re-selection overwrites until a payment completes against it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MethodSelection {
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub client_id: Uuid,
    pub selected_method: String,
    pub original_amount: Decimal,
    pub discount_percent: Decimal,
    pub amount_after_discount: Decimal,
    pub selected_utc: DateTime<Utc>,
    pub completed_payment: bool,
    pub payment_transaction_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn discount_table_is_fixed() {
        assert_eq!(PaymentMethod::BankTransfer.discount_percent(), Decimal::from(9));
        assert_eq!(PaymentMethod::CardSingle.discount_percent(), Decimal::from(8));
        assert_eq!(
            PaymentMethod::CardInstallments.discount_percent(),
            Decimal::from(4)
        );
        assert_eq!(PaymentMethod::Checks.discount_percent(), Decimal::ZERO);
    }

    #[test]
    fn bank_transfer_discount_on_round_total() {
        let amount = Decimal::from_str("50000.00").unwrap();
        let discounted = PaymentMethod::BankTransfer.discounted_amount(amount);
        assert_eq!(discounted, Decimal::from_str("45500.00").unwrap());
    }

    #[test]
    fn checks_take_no_discount() {
        let amount = Decimal::from_str("1234.56").unwrap();
        assert_eq!(PaymentMethod::Checks.discounted_amount(amount), amount);
    }

    #[test]
    fn discount_rounds_to_currency_unit() {
        // 8% off 99.99 = 91.9908, which settles at 91.99
        let amount = Decimal::from_str("99.99").unwrap();
        let discounted = PaymentMethod::CardSingle.discounted_amount(amount);
        assert_eq!(discounted, Decimal::from_str("91.99").unwrap());
    }

    #[test]
    fn unknown_method_is_rejected() {
        assert!(PaymentMethod::parse("cash").is_none());
        assert!(PaymentMethod::parse("").is_none());
        assert_eq!(
            PaymentMethod::parse("bank_transfer"),
            Some(PaymentMethod::BankTransfer)
        );
    }
}
