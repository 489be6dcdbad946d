// src/aggregation.rs
//! Joins attendance and settlement records by `emp_code` into one row per
//! employee and derives work-days, wage, expense and the unsettled balance.

use chrono::NaiveDate;
use rust_decimal::prelude::*;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::directory::{EmployeeIndex, ProjectCache};
use crate::reconciler::{QueryCache, QueryKey, ReconciledStore};
use crate::records::{
    AttendanceRecord, Category, Employee, EmployeeStatus, LedgerRecord, Project, SettlementRecord,
    SettlementType, WorkType,
};

pub const PLACEHOLDER_NAME: &str = "未知员工";

// --- Filters ---

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DateFilter {
    All,
    Day(NaiveDate),
    /// Inclusive on both ends; an open end is unbounded.
    Range {
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
}

impl DateFilter {
    pub fn contains(&self, date: NaiveDate) -> bool {
        match self {
            DateFilter::All => true,
            DateFilter::Day(day) => *day == date,
            DateFilter::Range { from, to } => {
                from.map_or(true, |from| date >= from) && to.map_or(true, |to| date <= to)
            }
        }
    }

    /// A single `date` wins over `from`/`to`.
    pub fn from_parts(
        date: Option<NaiveDate>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Self {
        match (date, from, to) {
            (Some(day), _, _) => DateFilter::Day(day),
            (None, None, None) => DateFilter::All,
            (None, from, to) => DateFilter::Range { from, to },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TypeFilter {
    All,
    Only(Category),
}

impl TypeFilter {
    pub fn matches(&self, category: Category) -> bool {
        match self {
            TypeFilter::All => true,
            TypeFilter::Only(wanted) => *wanted == category,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationFilters {
    pub project_id: String,
    pub date: DateFilter,
    pub record_type: TypeFilter,
}

impl AggregationFilters {
    pub fn project(project_id: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            date: DateFilter::All,
            record_type: TypeFilter::All,
        }
    }

    pub fn query_key(&self) -> QueryKey {
        QueryKey::new(&self.project_id, self.date.clone(), self.record_type)
    }
}

// --- Output ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub earliest: NaiveDate,
    pub latest: NaiveDate,
}

impl DateRange {
    fn single(date: NaiveDate) -> Self {
        Self {
            earliest: date,
            latest: date,
        }
    }

    fn include(range: Option<DateRange>, date: NaiveDate) -> Option<DateRange> {
        Some(match range {
            None => DateRange::single(date),
            Some(r) => DateRange {
                earliest: r.earliest.min(date),
                latest: r.latest.max(date),
            },
        })
    }

    fn merge(a: Option<DateRange>, b: Option<DateRange>) -> Option<DateRange> {
        match (a, b) {
            (Some(a), Some(b)) => Some(DateRange {
                earliest: a.earliest.min(b.earliest),
                latest: a.latest.max(b.latest),
            }),
            (a, None) => a,
            (None, b) => b,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedEmployeeRecord {
    pub emp_code: String,
    pub emp_name: String,
    pub employee_id: Option<String>,
    pub status: EmployeeStatus,
    pub labor_cost: Decimal,

    pub regular_hours: Decimal,
    pub overtime_hours: Decimal,
    /// Work-days rounded to two decimals, as used for the wage.
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
    /// `salary - expense`; negative when overpaid.
    pub unsettled: Decimal,
    pub date_range: Option<DateRange>,
}

// --- Numeric rules ---

/// Half-away-from-zero to two places, so 1.005 becomes 1.01.
pub fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Summed hours over the project divisor. A missing or zero divisor counts as
/// one; a non-positive hour sum yields zero days without dividing.
pub fn work_days(hours_sum: Decimal, divisor: Option<Decimal>) -> Decimal {
    if hours_sum <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let divisor = divisor
        .filter(|d| *d > Decimal::ZERO)
        .unwrap_or(Decimal::ONE);
    hours_sum / divisor
}

/// Each day count is rounded to two places, then the sum times the rate is
/// floored once.
pub fn point_work_amount(regular_days: Decimal, overtime_days: Decimal, labor_cost: Decimal) -> Decimal {
    ((round2(regular_days) + round2(overtime_days)) * labor_cost).floor()
}

/// Numeric `emp_code` order. Numeric codes sort before anything else; ties and
/// non-numeric codes fall back to string order.
pub fn compare_emp_codes(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<u64>(), b.trim().parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

// --- Join ---

#[derive(Debug, Clone)]
struct EmployeeRef {
    employee_id: Option<String>,
    emp_name: String,
    labor_cost: Decimal,
    status: EmployeeStatus,
}

impl EmployeeRef {
    fn known(employee: &Employee) -> Self {
        Self {
            employee_id: Some(employee.employee_id.clone()),
            emp_name: employee.emp_name.clone(),
            labor_cost: employee.labor_cost.unwrap_or(Decimal::ZERO),
            status: employee.status,
        }
    }

    fn placeholder() -> Self {
        Self {
            employee_id: None,
            emp_name: PLACEHOLDER_NAME.to_string(),
            labor_cost: Decimal::ZERO,
            status: EmployeeStatus::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct WorkTotals {
    regular_hours: Decimal,
    overtime_hours: Decimal,
    contract_amount: Decimal,
    quantity_amount: Decimal,
    short_term_amount: Decimal,
    dates: Option<DateRange>,
}

impl WorkTotals {
    fn add(&mut self, record: &AttendanceRecord) {
        match record.work_type {
            WorkType::PointWork => {
                self.regular_hours += record.regular_hours.unwrap_or_default();
                self.overtime_hours += record.overtime_hours.unwrap_or_default();
            }
            WorkType::Contract => self.contract_amount += record.contract_amount.unwrap_or_default(),
            WorkType::Quantity => self.quantity_amount += record.contract_amount.unwrap_or_default(),
            WorkType::ShortTerm => {
                self.short_term_amount += record.contract_amount.unwrap_or_default()
            }
        }
        self.dates = DateRange::include(self.dates, record.record_date);
    }
}

#[derive(Debug, Clone, Default)]
struct PaymentTotals {
    advance: Decimal,
    deduction: Decimal,
    company_transfer: Decimal,
    settlement_payment: Decimal,
    dates: Option<DateRange>,
}

impl PaymentTotals {
    fn add(&mut self, record: &SettlementRecord) {
        let slot = match record.record_type {
            SettlementType::Advance => &mut self.advance,
            SettlementType::Deduction => &mut self.deduction,
            SettlementType::CompanyTransfer => &mut self.company_transfer,
            SettlementType::SettlementPayment => &mut self.settlement_payment,
        };
        *slot += record.amount;
        self.dates = DateRange::include(self.dates, record.record_date);
    }
}

/// Resolves the join key of a record, registering who it belongs to.
/// Records of unknown employees are keyed by their raw `employee_id`.
fn join_code(
    employees: &BTreeMap<String, Employee>,
    employee_id: &str,
    people: &mut HashMap<String, EmployeeRef>,
) -> String {
    match employees.get(employee_id) {
        Some(employee) => {
            people
                .entry(employee.emp_code.clone())
                .or_insert_with(|| EmployeeRef::known(employee));
            employee.emp_code.clone()
        }
        None => {
            if !people.contains_key(employee_id) {
                warn!(
                    "Employee {} is not in the employee index, aggregating under a placeholder",
                    employee_id
                );
                people.insert(employee_id.to_string(), EmployeeRef::placeholder());
            }
            employee_id.to_string()
        }
    }
}

/// Pure join of already-scoped records. Every `emp_code` present on either
/// side yields exactly one row; the absent side contributes zeros.
pub fn aggregate_records(
    attendance: &[AttendanceRecord],
    settlements: &[SettlementRecord],
    employees: &BTreeMap<String, Employee>,
    project: Option<&Project>,
) -> Vec<AggregatedEmployeeRecord> {
    let mut people: HashMap<String, EmployeeRef> = HashMap::new();
    let mut work: HashMap<String, WorkTotals> = HashMap::new();
    let mut payments: HashMap<String, PaymentTotals> = HashMap::new();

    for record in attendance {
        let code = join_code(employees, &record.employee_id, &mut people);
        work.entry(code).or_default().add(record);
    }
    for record in settlements {
        let code = join_code(employees, &record.employee_id, &mut people);
        payments.entry(code).or_default().add(record);
    }

    let regular_divisor = project.and_then(|p| p.regular_hours);
    let overtime_divisor = project.and_then(|p| p.overtime_hours);

    let codes: BTreeSet<String> = work.keys().chain(payments.keys()).cloned().collect();
    let mut rows: Vec<AggregatedEmployeeRecord> = codes
        .into_iter()
        .map(|code| {
            let person = people.remove(&code).unwrap_or_else(EmployeeRef::placeholder);
            let work = work.remove(&code).unwrap_or_default();
            let paid = payments.remove(&code).unwrap_or_default();

            let regular_days = work_days(work.regular_hours, regular_divisor);
            let overtime_days = work_days(work.overtime_hours, overtime_divisor);
            let point_amount = point_work_amount(regular_days, overtime_days, person.labor_cost);

            let salary = point_amount
                + work.contract_amount
                + work.quantity_amount
                + work.short_term_amount;
            let expense =
                paid.advance + paid.deduction + paid.company_transfer + paid.settlement_payment;

            AggregatedEmployeeRecord {
                emp_code: code,
                emp_name: person.emp_name,
                employee_id: person.employee_id,
                status: person.status,
                labor_cost: person.labor_cost,
                regular_hours: work.regular_hours,
                overtime_hours: work.overtime_hours,
                regular_days: round2(regular_days),
                overtime_days: round2(overtime_days),
                point_work_amount: point_amount,
                contract_amount: work.contract_amount,
                quantity_amount: work.quantity_amount,
                short_term_amount: work.short_term_amount,
                advance: paid.advance,
                deduction: paid.deduction,
                company_transfer: paid.company_transfer,
                settlement_payment: paid.settlement_payment,
                salary,
                expense,
                unsettled: salary - expense,
                date_range: DateRange::merge(work.dates, paid.dates),
            }
        })
        .collect();

    rows.sort_by(|a, b| compare_emp_codes(&a.emp_code, &b.emp_code));
    rows
}

// --- Engine ---

#[derive(Debug, Clone, Default)]
pub struct ScopedRecords {
    pub attendance: Vec<AttendanceRecord>,
    pub settlements: Vec<SettlementRecord>,
}

/// Reads the reconciled stores and directory, applies filters, aggregates.
pub struct AggregationEngine {
    attendance: Arc<ReconciledStore<AttendanceRecord>>,
    settlements: Arc<ReconciledStore<SettlementRecord>>,
    employees: Arc<EmployeeIndex>,
    projects: Arc<ProjectCache>,
    cache: Arc<QueryCache<Vec<AggregatedEmployeeRecord>>>,
}

impl AggregationEngine {
    pub fn new(
        attendance: Arc<ReconciledStore<AttendanceRecord>>,
        settlements: Arc<ReconciledStore<SettlementRecord>>,
        employees: Arc<EmployeeIndex>,
        projects: Arc<ProjectCache>,
        cache: Arc<QueryCache<Vec<AggregatedEmployeeRecord>>>,
    ) -> Self {
        Self {
            attendance,
            settlements,
            employees,
            projects,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<QueryCache<Vec<AggregatedEmployeeRecord>>> {
        &self.cache
    }

    pub fn project(&self, project_id: &str) -> Option<Project> {
        self.projects.get(project_id)
    }

    /// Raw records in scope, for the flow feed.
    pub fn scoped_records(&self, filters: &AggregationFilters) -> ScopedRecords {
        let attendance = self
            .attendance
            .load_scope(&filters.project_id, &filters.date)
            .into_iter()
            .filter(|record| filters.record_type.matches(record.category()))
            .collect();
        let settlements = self
            .settlements
            .load_scope(&filters.project_id, &filters.date)
            .into_iter()
            .filter(|record| filters.record_type.matches(record.category()))
            .collect();
        ScopedRecords {
            attendance,
            settlements,
        }
    }

    fn compute(&self, filters: &AggregationFilters) -> Vec<AggregatedEmployeeRecord> {
        let scoped = self.scoped_records(filters);
        let employees = self.employees.all();
        let project = self.projects.get(&filters.project_id);
        if project.is_none() {
            warn!(
                "Project {} not in cache, hour divisors default to 1",
                filters.project_id
            );
        }
        let rows = aggregate_records(
            &scoped.attendance,
            &scoped.settlements,
            &employees,
            project.as_ref(),
        );
        debug!(
            "Aggregated {} attendance and {} settlement records into {} employees for {}",
            scoped.attendance.len(),
            scoped.settlements.len(),
            rows.len(),
            filters.project_id
        );
        rows
    }

    pub fn aggregate(&self, filters: &AggregationFilters) -> Vec<AggregatedEmployeeRecord> {
        self.cache
            .get_or_compute(filters.query_key(), false, || self.compute(filters))
    }

    /// Skips the query cache, e.g. while editing a specific record.
    pub fn aggregate_fresh(&self, filters: &AggregationFilters) -> Vec<AggregatedEmployeeRecord> {
        self.cache
            .get_or_compute(filters.query_key(), true, || self.compute(filters))
    }

    /// Whole-project balance of one employee, always recomputed.
    pub fn employee_balance(&self, employee: &Employee) -> Option<AggregatedEmployeeRecord> {
        self.aggregate_fresh(&AggregationFilters::project(&employee.project_id))
            .into_iter()
            .find(|row| row.emp_code == employee.emp_code)
    }
}
