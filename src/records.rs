// src/records.rs
use chrono::{DateTime, NaiveDate, Utc};
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

// --- Category Types ---

/// Attendance sub-types. The serialized form is the label stored in remote rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkType {
    #[serde(rename = "点工")]
    PointWork,
    #[serde(rename = "包工")]
    Contract,
    #[serde(rename = "工量")]
    Quantity,
    #[serde(rename = "短工")]
    ShortTerm,
}

impl WorkType {
    pub fn is_hourly(&self) -> bool {
        matches!(self, WorkType::PointWork)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettlementType {
    #[serde(rename = "借支")]
    Advance,
    #[serde(rename = "扣款")]
    Deduction,
    #[serde(rename = "公司转账")]
    CompanyTransfer,
    #[serde(rename = "结算")]
    SettlementPayment,
}

/// Every kind of line that can appear in a ledger, across both record stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Category {
    Work(WorkType),
    Settlement(SettlementType),
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Work(WorkType::PointWork),
        Category::Work(WorkType::Contract),
        Category::Work(WorkType::Quantity),
        Category::Work(WorkType::ShortTerm),
        Category::Settlement(SettlementType::Advance),
        Category::Settlement(SettlementType::Deduction),
        Category::Settlement(SettlementType::CompanyTransfer),
        Category::Settlement(SettlementType::SettlementPayment),
    ];

    /// Tie-break rank for the flow feed when two lines share a date.
    /// Short-term work has no slot of its own and follows quantity work.
    pub fn flow_rank(&self) -> u8 {
        match self {
            Category::Work(WorkType::PointWork) => 0,
            Category::Work(WorkType::Contract) => 1,
            Category::Work(WorkType::Quantity) => 2,
            Category::Work(WorkType::ShortTerm) => 3,
            Category::Settlement(SettlementType::Advance) => 4,
            Category::Settlement(SettlementType::Deduction) => 5,
            Category::Settlement(SettlementType::CompanyTransfer) => 6,
            Category::Settlement(SettlementType::SettlementPayment) => 7,
        }
    }

    pub fn label(&self) -> &'static str {
        CATEGORY_LABELS.get(self).copied().unwrap_or("未知")
    }

    /// Parses either the stored label or the English key used by the HTTP API.
    pub fn parse(value: &str) -> Option<Category> {
        let value = value.trim();
        if let Some((category, _)) = CATEGORY_LABELS.iter().find(|(_, label)| **label == value) {
            return Some(*category);
        }
        CATEGORY_KEYS
            .iter()
            .find(|(_, key)| key.eq_ignore_ascii_case(value))
            .map(|(category, _)| *category)
    }
}

// Display labels live apart from the enum so logic never branches on strings.
static CATEGORY_LABELS: Lazy<HashMap<Category, &'static str>> = Lazy::new(|| {
    HashMap::from([
        (Category::Work(WorkType::PointWork), "点工"),
        (Category::Work(WorkType::Contract), "包工"),
        (Category::Work(WorkType::Quantity), "工量"),
        (Category::Work(WorkType::ShortTerm), "短工"),
        (Category::Settlement(SettlementType::Advance), "借支"),
        (Category::Settlement(SettlementType::Deduction), "扣款"),
        (Category::Settlement(SettlementType::CompanyTransfer), "公司转账"),
        (Category::Settlement(SettlementType::SettlementPayment), "结算"),
    ])
});

static CATEGORY_KEYS: Lazy<Vec<(Category, &'static str)>> = Lazy::new(|| {
    vec![
        (Category::Work(WorkType::PointWork), "point_work"),
        (Category::Work(WorkType::Contract), "contract"),
        (Category::Work(WorkType::Quantity), "quantity"),
        (Category::Work(WorkType::ShortTerm), "short_term"),
        (Category::Settlement(SettlementType::Advance), "advance"),
        (Category::Settlement(SettlementType::Deduction), "deduction"),
        (Category::Settlement(SettlementType::CompanyTransfer), "company_transfer"),
        (Category::Settlement(SettlementType::SettlementPayment), "settlement_payment"),
    ]
});

/// Which of the two record stores a record (or queue entry) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCategory {
    Attendance,
    Settlement,
}

// --- Records ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub record_id: String,
    pub project_id: String,
    pub employee_id: String,
    pub record_date: NaiveDate,
    pub work_type: WorkType,
    #[serde(default)]
    pub regular_hours: Option<Decimal>,
    #[serde(default)]
    pub overtime_hours: Option<Decimal>,
    #[serde(default)]
    pub contract_amount: Option<Decimal>,
    #[serde(default)]
    pub image_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_local: Option<bool>,
}

pub const AUDITED: &str = "已审核";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub settlement_id: String,
    pub project_id: String,
    pub employee_id: String,
    pub record_date: NaiveDate,
    pub record_type: SettlementType,
    pub amount: Decimal,
    #[serde(default)]
    pub payer: Option<String>,
    #[serde(default)]
    pub remark: Option<String>,
    #[serde(default)]
    pub audit_status: Option<String>,
    #[serde(default)]
    pub image_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SettlementRecord {
    pub fn is_audited(&self) -> bool {
        self.audit_status.as_deref() == Some(AUDITED)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmployeeStatus {
    #[serde(rename = "在职")]
    Active,
    #[serde(rename = "离职")]
    Departed,
    #[serde(rename = "结清")]
    Settled,
}

impl EmployeeStatus {
    pub fn label(&self) -> &'static str {
        match self {
            EmployeeStatus::Active => "在职",
            EmployeeStatus::Departed => "离职",
            EmployeeStatus::Settled => "结清",
        }
    }
}

impl Default for EmployeeStatus {
    fn default() -> Self {
        EmployeeStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
    pub employee_id: String,
    pub project_id: String,
    pub emp_code: String,
    pub emp_name: String,
    /// Wage per work-day. Missing rates degrade to zero wage.
    #[serde(default)]
    pub labor_cost: Option<Decimal>,
    #[serde(default)]
    pub status: EmployeeStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    pub project_name: String,
    /// Hours that make up one regular work-day.
    #[serde(default)]
    pub regular_hours: Option<Decimal>,
    /// Hours that make up one overtime work-day.
    #[serde(default)]
    pub overtime_hours: Option<Decimal>,
}

// --- Record abstraction shared by both stores ---

pub trait LedgerRecord: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const CATEGORY: RecordCategory;
    const IDENTITY_FIELD: &'static str;

    fn identity(&self) -> &str;
    fn project_id(&self) -> &str;
    fn employee_id(&self) -> &str;
    fn record_date(&self) -> NaiveDate;
    fn category(&self) -> Category;
    fn image_ids(&self) -> &[String];
    fn validate(&self) -> Result<(), ValidationError>;
}

impl LedgerRecord for AttendanceRecord {
    const CATEGORY: RecordCategory = RecordCategory::Attendance;
    const IDENTITY_FIELD: &'static str = "record_id";

    fn identity(&self) -> &str {
        &self.record_id
    }
    fn project_id(&self) -> &str {
        &self.project_id
    }
    fn employee_id(&self) -> &str {
        &self.employee_id
    }
    fn record_date(&self) -> NaiveDate {
        self.record_date
    }
    fn category(&self) -> Category {
        Category::Work(self.work_type)
    }
    fn image_ids(&self) -> &[String] {
        &self.image_ids
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_field("record_id", &self.record_id)?;
        require_field("project_id", &self.project_id)?;
        require_field("employee_id", &self.employee_id)?;

        for (field, value) in [
            ("regular_hours", self.regular_hours),
            ("overtime_hours", self.overtime_hours),
            ("contract_amount", self.contract_amount),
        ] {
            if let Some(v) = value {
                if v.is_sign_negative() && !v.is_zero() {
                    return Err(ValidationError::Negative {
                        field: field.to_string(),
                        value: v,
                    });
                }
            }
        }

        if self.work_type.is_hourly() {
            if self.regular_hours.is_none() && self.overtime_hours.is_none() {
                return Err(ValidationError::MissingField {
                    field: "regular_hours".to_string(),
                    record_type: self.category().label().to_string(),
                });
            }
        } else if self.contract_amount.is_none() {
            return Err(ValidationError::MissingField {
                field: "contract_amount".to_string(),
                record_type: self.category().label().to_string(),
            });
        }
        Ok(())
    }
}

impl LedgerRecord for SettlementRecord {
    const CATEGORY: RecordCategory = RecordCategory::Settlement;
    const IDENTITY_FIELD: &'static str = "settlement_id";

    fn identity(&self) -> &str {
        &self.settlement_id
    }
    fn project_id(&self) -> &str {
        &self.project_id
    }
    fn employee_id(&self) -> &str {
        &self.employee_id
    }
    fn record_date(&self) -> NaiveDate {
        self.record_date
    }
    fn category(&self) -> Category {
        Category::Settlement(self.record_type)
    }
    fn image_ids(&self) -> &[String] {
        &self.image_ids
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_field("settlement_id", &self.settlement_id)?;
        require_field("project_id", &self.project_id)?;
        require_field("employee_id", &self.employee_id)?;
        if self.amount.is_sign_negative() && !self.amount.is_zero() {
            return Err(ValidationError::Negative {
                field: "amount".to_string(),
                value: self.amount,
            });
        }
        if let Some(status) = &self.audit_status {
            if status != AUDITED {
                return Err(ValidationError::InvalidValue {
                    field: "audit_status".to_string(),
                    value: status.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Mandatory field missing: {field} for record type {record_type}")]
    MissingField { field: String, record_type: String },
    #[error("Field {field} must not be negative, got {value}")]
    Negative { field: String, value: Decimal },
    #[error("Field {field} has unsupported value '{value}'")]
    InvalidValue { field: String, value: String },
}

/// Locally generated identity, e.g. `local_1714550400000_k3J9xQ2a`.
pub fn generate_id(prefix: &str, now: DateTime<Utc>) -> String {
    use rand::{distributions::Alphanumeric, thread_rng, Rng};
    let suffix: String = thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{}_{}_{}", prefix, now.timestamp_millis(), suffix)
}

fn require_field(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: field.to_string(),
            record_type: "record".to_string(),
        });
    }
    Ok(())
}
