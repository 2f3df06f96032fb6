use crate::error::DecodeError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Normalised public trade consumed by the bucket accumulator.
///
/// Construction is fallible so that every `Trade` in the system has a strictly positive price
/// and quantity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Trade {
    price: Decimal,
    quantity: Decimal,
    occurred_at: DateTime<Utc>,
    is_buyer_aggressor: bool,
}

impl Trade {
    pub fn new(
        price: Decimal,
        quantity: Decimal,
        occurred_at: DateTime<Utc>,
        is_buyer_aggressor: bool,
    ) -> Result<Self, DecodeError> {
        if quantity <= Decimal::ZERO {
            return Err(DecodeError::InvalidTrade(format!(
                "quantity must be positive, got {quantity}"
            )));
        }
        if price <= Decimal::ZERO {
            return Err(DecodeError::InvalidTrade(format!(
                "price must be positive, got {price}"
            )));
        }

        Ok(Self {
            price,
            quantity,
            occurred_at,
            is_buyer_aggressor,
        })
    }

    pub fn price(&self) -> Decimal {
        self.price
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn is_buyer_aggressor(&self) -> bool {
        self.is_buyer_aggressor
    }
}
