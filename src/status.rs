// src/status.rs
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::aggregation::AggregationEngine;
use crate::directory::EmployeeIndex;
use crate::records::{Employee, EmployeeStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub success: bool,
    pub message: String,
}

impl StatusChange {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Flips an employee between settled and unsettled.
#[async_trait]
pub trait EmployeeStatusManager: Send + Sync {
    async fn set_as_settled(&self, employee: &Employee) -> StatusChange;
    async fn set_as_unsettled(&self, employee: &Employee) -> StatusChange;
}

/// Writes the status straight into the local employee index.
pub struct LocalEmployeeStatusManager {
    employees: Arc<EmployeeIndex>,
}

impl LocalEmployeeStatusManager {
    pub fn new(employees: Arc<EmployeeIndex>) -> Self {
        Self { employees }
    }

    fn apply(&self, employee: &Employee, status: EmployeeStatus) -> StatusChange {
        match self.employees.set_status(&employee.employee_id, status) {
            Ok(Some(updated)) => StatusChange::ok(format!(
                "{} is now {}",
                updated.emp_name,
                updated.status.label()
            )),
            Ok(None) => StatusChange::refused(format!(
                "Employee {} not found",
                employee.employee_id
            )),
            Err(e) => {
                warn!(
                    "Failed to store status {:?} for {}: {}",
                    status, employee.employee_id, e
                );
                StatusChange::refused(format!("Failed to store status: {}", e))
            }
        }
    }
}

#[async_trait]
impl EmployeeStatusManager for LocalEmployeeStatusManager {
    async fn set_as_settled(&self, employee: &Employee) -> StatusChange {
        self.apply(employee, EmployeeStatus::Settled)
    }

    async fn set_as_unsettled(&self, employee: &Employee) -> StatusChange {
        self.apply(employee, EmployeeStatus::Active)
    }
}

/// Refuses to settle while anything is still owed to the employee.
pub fn check_settleable(unsettled: Decimal) -> Result<(), String> {
    if unsettled > Decimal::ZERO {
        Err(format!(
            "Unsettled balance is {}, it must be zero or less before settling",
            unsettled
        ))
    } else {
        Ok(())
    }
}

/// Guards every status transition with the balance computed from the ledger.
pub struct SettlementGate {
    manager: Arc<dyn EmployeeStatusManager>,
    engine: Arc<AggregationEngine>,
    employees: Arc<EmployeeIndex>,
}

impl SettlementGate {
    pub fn new(
        manager: Arc<dyn EmployeeStatusManager>,
        engine: Arc<AggregationEngine>,
        employees: Arc<EmployeeIndex>,
    ) -> Self {
        Self {
            manager,
            engine,
            employees,
        }
    }

    /// Current whole-project balance; zero when the employee has no records.
    pub fn unsettled_of(&self, employee: &Employee) -> Decimal {
        self.engine
            .employee_balance(employee)
            .map(|row| row.unsettled)
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn settle(&self, employee_id: &str, confirmed: bool) -> StatusChange {
        let Some(employee) = self.employees.get(employee_id) else {
            return StatusChange::refused(format!("Employee {} not found", employee_id));
        };
        if employee.status == EmployeeStatus::Settled {
            return StatusChange::ok(format!("{} is already settled", employee.emp_name));
        }
        let unsettled = self.unsettled_of(&employee);
        if let Err(message) = check_settleable(unsettled) {
            warn!(
                "Refusing to settle {} ({}): unsettled {}",
                employee.emp_name, employee.emp_code, unsettled
            );
            return StatusChange::refused(message);
        }
        if !confirmed {
            return StatusChange::refused("Settling requires confirmation");
        }

        let change = self.manager.set_as_settled(&employee).await;
        if change.success {
            info!("Employee {} settled with balance {}", employee.emp_code, unsettled);
            self.engine.cache().invalidate_project(&employee.project_id);
        }
        change
    }

    pub async fn unsettle(&self, employee_id: &str) -> StatusChange {
        let Some(employee) = self.employees.get(employee_id) else {
            return StatusChange::refused(format!("Employee {} not found", employee_id));
        };
        let change = self.manager.set_as_unsettled(&employee).await;
        if change.success {
            info!("Employee {} marked unsettled", employee.emp_code);
            self.engine.cache().invalidate_project(&employee.project_id);
        }
        change
    }
}

/// Status manager that records calls instead of acting on them.
#[cfg(test)]
#[derive(Default)]
pub struct RecordingStatusManager {
    calls: std::sync::Mutex<Vec<(String, EmployeeStatus)>>,
}

#[cfg(test)]
impl RecordingStatusManager {
    pub fn calls(&self) -> Vec<(String, EmployeeStatus)> {
        self.calls.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl EmployeeStatusManager for RecordingStatusManager {
    async fn set_as_settled(&self, employee: &Employee) -> StatusChange {
        self.calls
            .lock()
            .unwrap()
            .push((employee.employee_id.clone(), EmployeeStatus::Settled));
        StatusChange::ok("settled")
    }

    async fn set_as_unsettled(&self, employee: &Employee) -> StatusChange {
        self.calls
            .lock()
            .unwrap()
            .push((employee.employee_id.clone(), EmployeeStatus::Active));
        StatusChange::ok("unsettled")
    }
}
