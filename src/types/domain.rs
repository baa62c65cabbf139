//! Domain entities the importers upsert into.
//!
//! These are owned by the wider portal application; the worker only writes
//! them by natural key. Dealers key by dealer code, customers by email,
//! contracts by the composite agreement identifier, monthly stats by
//! (dealer code, year, month).

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Placeholder domain for dealers whose master row carries no email.
pub const DEALER_PLACEHOLDER_DOMAIN: &str = "dealers.invalid";

/// Placeholder domain for customers synthesized from contract rows.
pub const CUSTOMER_PLACEHOLDER_DOMAIN: &str = "customers.invalid";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dealer {
    pub id: Uuid,
    /// Stable zero-padded 4-digit dealer code; the natural key.
    pub code: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: Uuid,
    /// Natural key. Synthesized when the source row has no address.
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
}

/// Derived, never stored verbatim from the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Active,
    Expired,
    Cancelled,
}

/// Canonical coverage plans. Source files use dozens of abbreviations;
/// everything unrecognized falls back to the basic powertrain plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoveragePlan {
    Powertrain,
    Silver,
    Gold,
    Platinum,
}

impl CoveragePlan {
    pub fn from_code(code: &str) -> Self {
        match code.trim().to_uppercase().as_str() {
            "SLV" | "SIL" | "SV" | "S" | "SILVER" => CoveragePlan::Silver,
            "GLD" | "GC" | "G" | "GL" | "GOLD" => CoveragePlan::Gold,
            "PLT" | "PP" | "PL" | "TC" | "TOTAL" | "PLATINUM" => CoveragePlan::Platinum,
            // "PT", "PWR", blanks and anything unknown map to the base plan.
            _ => CoveragePlan::Powertrain,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CoveragePlan::Powertrain => "powertrain",
            CoveragePlan::Silver => "silver",
            CoveragePlan::Gold => "gold",
            CoveragePlan::Platinum => "platinum",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub id: Uuid,
    /// `{agreement}-{agreementSuffix}`; the natural key.
    pub agreement_key: String,
    pub dealer_id: Uuid,
    pub customer_id: Uuid,
    pub plan: CoveragePlan,
    pub status: ContractStatus,
    pub purchase_date: Option<NaiveDate>,
    pub expiration_date: Option<NaiveDate>,
    pub cancellation_post_date: Option<NaiveDate>,
    pub vin: Option<String>,
}

/// Per-dealer, per-month statistics. Different source files populate
/// disjoint field groups of the same period record over time, which is why
/// importers only ever set the fields they own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyDealerStats {
    pub dealer_code: String,
    pub year: i32,
    pub month: u32,
    // Units report.
    pub new_units_sold: Option<i64>,
    pub used_units_sold: Option<i64>,
    // Exterior/interior service report.
    pub exterior_repairs: Option<i64>,
    pub interior_repairs: Option<i64>,
    pub service_amount: Option<f64>,
    // Billing report.
    pub billed_contracts: Option<i64>,
    pub billed_amount: Option<f64>,
    // Campaign results.
    pub campaign_mailed: Option<i64>,
    pub campaign_responses: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_lookup_maps_aliases() {
        assert_eq!(CoveragePlan::from_code("slv"), CoveragePlan::Silver);
        assert_eq!(CoveragePlan::from_code("GLD"), CoveragePlan::Gold);
        assert_eq!(CoveragePlan::from_code("TOTAL"), CoveragePlan::Platinum);
    }

    #[test]
    fn test_plan_lookup_defaults_to_basic() {
        assert_eq!(CoveragePlan::from_code(""), CoveragePlan::Powertrain);
        assert_eq!(CoveragePlan::from_code("???"), CoveragePlan::Powertrain);
        assert_eq!(CoveragePlan::from_code("PWR"), CoveragePlan::Powertrain);
    }
}
