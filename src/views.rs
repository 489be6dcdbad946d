// src/views.rs
//! Presentation shaping of aggregated rows. Pure functions, no storage access.
//!
//! Worker, total and unsettled views show amounts floored to whole units.
//! The flow feed shows per-category subtotals rounded to two decimals.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::aggregation::{round2, AggregatedEmployeeRecord, DateRange, ScopedRecords, PLACEHOLDER_NAME};
use crate::records::{Category, Employee, EmployeeStatus, LedgerRecord, WorkType};

/// Whole numbers print as-is; anything else is floored, so 123.99 shows "123".
pub fn format_amount(value: Decimal) -> String {
    value.floor().normalize().to_string()
}

/// Two-decimal rounding used only by flow subtotals.
pub fn format_subtotal(value: Decimal) -> String {
    format!("{:.2}", round2(value))
}

fn format_days(value: Decimal) -> String {
    format!("{:.2}", round2(value))
}

// --- Worker view ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerRow {
    pub emp_code: String,
    pub emp_name: String,
    pub status: &'static str,
    pub regular_days: String,
    pub overtime_days: String,
    pub point_work_amount: String,
    pub contract_amount: String,
    pub quantity_amount: String,
    pub short_term_amount: String,
    pub salary: String,
    pub advance: String,
    pub deduction: String,
    pub company_transfer: String,
    pub settlement_payment: String,
    pub expense: String,
    pub unsettled: String,
    pub date_range: Option<DateRange>,
}

impl From<&AggregatedEmployeeRecord> for WorkerRow {
    fn from(row: &AggregatedEmployeeRecord) -> Self {
        Self {
            emp_code: row.emp_code.clone(),
            emp_name: row.emp_name.clone(),
            status: row.status.label(),
            regular_days: format_days(row.regular_days),
            overtime_days: format_days(row.overtime_days),
            point_work_amount: format_amount(row.point_work_amount),
            contract_amount: format_amount(row.contract_amount),
            quantity_amount: format_amount(row.quantity_amount),
            short_term_amount: format_amount(row.short_term_amount),
            salary: format_amount(row.salary),
            advance: format_amount(row.advance),
            deduction: format_amount(row.deduction),
            company_transfer: format_amount(row.company_transfer),
            settlement_payment: format_amount(row.settlement_payment),
            expense: format_amount(row.expense),
            unsettled: format_amount(row.unsettled),
            date_range: row.date_range,
        }
    }
}

pub fn worker_view(rows: &[AggregatedEmployeeRecord]) -> Vec<WorkerRow> {
    rows.iter().map(WorkerRow::from).collect()
}

// --- Total view ---

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerTotals {
    pub employee_count: usize,
    pub regular_hours: Decimal,
    pub overtime_hours: Decimal,
    pub regular_days: Decimal,
    pub overtime_days: Decimal,
    pub point_work_amount: Decimal,
    pub contract_amount: Decimal,
    pub quantity_amount: Decimal,
    pub short_term_amount: Decimal,
    pub advance: Decimal,
    pub deduction: Decimal,
    pub company_transfer: Decimal,
    pub settlement_payment: Decimal,
    pub salary: Decimal,
    pub expense: Decimal,
    pub unsettled: Decimal,
    pub date_range: Option<DateRange>,
}

/// Grand total over employees. Sums the per-employee rounded days and floored
/// wages, so it always agrees with the worker view.
pub fn total_view(rows: &[AggregatedEmployeeRecord]) -> LedgerTotals {
    rows.iter().fold(LedgerTotals::default(), |mut totals, row| {
        totals.employee_count += 1;
        totals.regular_hours += row.regular_hours;
        totals.overtime_hours += row.overtime_hours;
        totals.regular_days += row.regular_days;
        totals.overtime_days += row.overtime_days;
        totals.point_work_amount += row.point_work_amount;
        totals.contract_amount += row.contract_amount;
        totals.quantity_amount += row.quantity_amount;
        totals.short_term_amount += row.short_term_amount;
        totals.advance += row.advance;
        totals.deduction += row.deduction;
        totals.company_transfer += row.company_transfer;
        totals.settlement_payment += row.settlement_payment;
        totals.salary += row.salary;
        totals.expense += row.expense;
        totals.unsettled += row.unsettled;
        totals.date_range = match (totals.date_range, row.date_range) {
            (Some(a), Some(b)) => Some(DateRange {
                earliest: a.earliest.min(b.earliest),
                latest: a.latest.max(b.latest),
            }),
            (a, b) => a.or(b),
        };
        totals
    })
}

// --- Unsettled view ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnsettledEntry {
    pub emp_code: String,
    pub emp_name: String,
    pub employee_id: Option<String>,
    pub status: &'static str,
    pub unsettled: Decimal,
    pub display: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnsettledView {
    /// Employees not yet marked settled.
    pub owed: Vec<UnsettledEntry>,
    pub settled: Vec<UnsettledEntry>,
    /// Sum over every employee in scope, settled ones included.
    pub total_unsettled: Decimal,
    pub total_display: String,
}

pub fn unsettled_view(rows: &[AggregatedEmployeeRecord]) -> UnsettledView {
    let (settled, owed): (Vec<_>, Vec<_>) = rows
        .iter()
        .map(|row| {
            (
                row.status,
                UnsettledEntry {
                    emp_code: row.emp_code.clone(),
                    emp_name: row.emp_name.clone(),
                    employee_id: row.employee_id.clone(),
                    status: row.status.label(),
                    unsettled: row.unsettled,
                    display: format_amount(row.unsettled),
                },
            )
        })
        .partition(|(status, _)| *status == EmployeeStatus::Settled);
    let total_unsettled: Decimal = rows.iter().map(|row| row.unsettled).sum();
    UnsettledView {
        owed: owed.into_iter().map(|(_, entry)| entry).collect(),
        settled: settled.into_iter().map(|(_, entry)| entry).collect(),
        total_unsettled,
        total_display: format_amount(total_unsettled),
    }
}

// --- Flow view ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowLine {
    pub record_date: NaiveDate,
    pub category: Category,
    pub label: &'static str,
    pub identity: String,
    pub employee_id: String,
    pub emp_code: String,
    pub emp_name: String,
    /// Point-work hours (regular plus overtime); `None` for amount lines.
    pub hours: Option<Decimal>,
    pub amount: Option<Decimal>,
    pub remark: Option<String>,
    pub audited: bool,
    pub image_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowSubtotal {
    pub category: Category,
    pub label: &'static str,
    pub count: usize,
    pub hours: Option<String>,
    pub amount: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowView {
    pub lines: Vec<FlowLine>,
    pub subtotals: Vec<FlowSubtotal>,
}

fn line_base(
    record: &impl LedgerRecord,
    employees: &BTreeMap<String, Employee>,
) -> (String, String) {
    match employees.get(record.employee_id()) {
        Some(employee) => (employee.emp_code.clone(), employee.emp_name.clone()),
        None => (record.employee_id().to_string(), PLACEHOLDER_NAME.to_string()),
    }
}

/// Chronological feed over raw records; same-day lines follow the fixed
/// category order. Equal keys keep their input order.
pub fn flow_view(scoped: &ScopedRecords, employees: &BTreeMap<String, Employee>) -> FlowView {
    let mut lines = Vec::with_capacity(scoped.attendance.len() + scoped.settlements.len());

    for record in &scoped.attendance {
        let (emp_code, emp_name) = line_base(record, employees);
        let (hours, amount) = match record.work_type {
            WorkType::PointWork => (
                Some(
                    record.regular_hours.unwrap_or_default()
                        + record.overtime_hours.unwrap_or_default(),
                ),
                None,
            ),
            _ => (None, Some(record.contract_amount.unwrap_or_default())),
        };
        lines.push(FlowLine {
            record_date: record.record_date,
            category: record.category(),
            label: record.category().label(),
            identity: record.record_id.clone(),
            employee_id: record.employee_id.clone(),
            emp_code,
            emp_name,
            hours,
            amount,
            remark: None,
            audited: false,
            image_count: record.image_ids.len(),
        });
    }

    for record in &scoped.settlements {
        let (emp_code, emp_name) = line_base(record, employees);
        lines.push(FlowLine {
            record_date: record.record_date,
            category: record.category(),
            label: record.category().label(),
            identity: record.settlement_id.clone(),
            employee_id: record.employee_id.clone(),
            emp_code,
            emp_name,
            hours: None,
            amount: Some(record.amount),
            remark: record.remark.clone(),
            audited: record.is_audited(),
            image_count: record.image_ids.len(),
        });
    }

    lines.sort_by(|a, b| {
        a.record_date
            .cmp(&b.record_date)
            .then_with(|| a.category.flow_rank().cmp(&b.category.flow_rank()))
    });

    let subtotals = Category::ALL
        .iter()
        .filter_map(|category| {
            let in_category: Vec<&FlowLine> =
                lines.iter().filter(|line| line.category == *category).collect();
            if in_category.is_empty() {
                return None;
            }
            let hours: Option<Decimal> = in_category.iter().map(|line| line.hours).sum();
            let amount: Option<Decimal> = in_category.iter().map(|line| line.amount).sum();
            Some(FlowSubtotal {
                category: *category,
                label: category.label(),
                count: in_category.len(),
                hours: hours.map(format_subtotal),
                amount: amount.map(format_subtotal),
            })
        })
        .collect();

    FlowView { lines, subtotals }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{AttendanceRecord, SettlementRecord, SettlementType};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn row(code: &str, status: EmployeeStatus, salary: Decimal, expense: Decimal) -> AggregatedEmployeeRecord {
        AggregatedEmployeeRecord {
            emp_code: code.to_string(),
            emp_name: format!("工人{}", code),
            employee_id: Some(format!("e{}", code)),
            status,
            labor_cost: dec!(100),
            regular_hours: Decimal::ZERO,
            overtime_hours: Decimal::ZERO,
            regular_days: Decimal::ZERO,
            overtime_days: Decimal::ZERO,
            point_work_amount: salary,
            contract_amount: Decimal::ZERO,
            quantity_amount: Decimal::ZERO,
            short_term_amount: Decimal::ZERO,
            advance: expense,
            deduction: Decimal::ZERO,
            company_transfer: Decimal::ZERO,
            settlement_payment: Decimal::ZERO,
            salary,
            expense,
            unsettled: salary - expense,
            date_range: None,
        }
    }

    #[test]
    fn test_format_amount_floors_non_integers() {
        assert_eq!(format_amount(dec!(123.99)), "123");
        assert_eq!(format_amount(dec!(200.00)), "200");
        assert_eq!(format_amount(dec!(-13)), "-13");
        assert_eq!(format_subtotal(dec!(123.995)), "124.00");
        assert_eq!(format_subtotal(dec!(7)), "7.00");
    }

    #[test]
    fn test_unsettled_view_partitions_but_totals_everyone() {
        let rows = vec![
            row("1", EmployeeStatus::Active, dec!(1000), dec!(400)),
            row("2", EmployeeStatus::Settled, dec!(500), dec!(450)),
            row("3", EmployeeStatus::Departed, dec!(100), dec!(150)),
        ];
        let view = unsettled_view(&rows);
        assert_eq!(view.owed.len(), 2);
        assert_eq!(view.settled.len(), 1);
        assert_eq!(view.settled[0].emp_code, "2");
        assert_eq!(view.total_unsettled, dec!(600));
        assert_eq!(view.total_display, "600");
    }

    #[test]
    fn test_total_view_sums_per_employee_rows() {
        let rows = vec![
            row("1", EmployeeStatus::Active, dec!(187), dec!(200)),
            row("2", EmployeeStatus::Active, dec!(101), Decimal::ZERO),
        ];
        let totals = total_view(&rows);
        assert_eq!(totals.employee_count, 2);
        assert_eq!(totals.salary, dec!(288));
        assert_eq!(totals.expense, dec!(200));
        assert_eq!(totals.unsettled, dec!(88));
        assert_eq!(totals, total_view(&rows));
    }

    #[test]
    fn test_flow_view_orders_by_date_then_category() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let date = |d| NaiveDate::from_ymd_opt(2024, 5, d).unwrap();
        let attendance = |id: &str, d, work_type, hours: Option<Decimal>, amount: Option<Decimal>| {
            AttendanceRecord {
                record_id: id.to_string(),
                project_id: "p1".to_string(),
                employee_id: "e1".to_string(),
                record_date: date(d),
                work_type,
                regular_hours: hours,
                overtime_hours: None,
                contract_amount: amount,
                image_ids: vec![],
                created_at: at,
                updated_at: at,
                is_local: None,
            }
        };
        let settlement = |id: &str, d, record_type, amount| SettlementRecord {
            settlement_id: id.to_string(),
            project_id: "p1".to_string(),
            employee_id: "e1".to_string(),
            record_date: date(d),
            record_type,
            amount,
            payer: None,
            remark: None,
            audit_status: None,
            image_ids: vec![],
            created_at: at,
            updated_at: at,
        };

        let scoped = ScopedRecords {
            attendance: vec![
                attendance("a1", 2, WorkType::ShortTerm, None, Some(dec!(80.125))),
                attendance("a2", 2, WorkType::PointWork, Some(dec!(8)), None),
                attendance("a3", 1, WorkType::Quantity, None, Some(dec!(50))),
            ],
            settlements: vec![
                settlement("s1", 2, SettlementType::Advance, dec!(100)),
                settlement("s2", 1, SettlementType::SettlementPayment, dec!(20)),
                settlement("s3", 2, SettlementType::Advance, dec!(0.5)),
            ],
        };
        let view = flow_view(&scoped, &BTreeMap::new());
        let order: Vec<&str> = view.lines.iter().map(|l| l.identity.as_str()).collect();
        assert_eq!(order, vec!["a3", "s2", "a2", "a1", "s1", "s3"]);
        assert_eq!(view.lines[0].emp_name, PLACEHOLDER_NAME);

        let advance = view
            .subtotals
            .iter()
            .find(|s| s.category == Category::Settlement(SettlementType::Advance))
            .unwrap();
        assert_eq!(advance.count, 2);
        assert_eq!(advance.amount.as_deref(), Some("100.50"));
        let short_term = view
            .subtotals
            .iter()
            .find(|s| s.category == Category::Work(WorkType::ShortTerm))
            .unwrap();
        assert_eq!(short_term.amount.as_deref(), Some("80.13"));
        let point = &view.subtotals[0];
        assert_eq!(point.hours.as_deref(), Some("8.00"));
        assert_eq!(point.amount, None);
    }
}
