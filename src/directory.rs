// src/directory.rs
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::aggregation::compare_emp_codes;
use crate::local_store::{keys, write_json, LocalStorage, StorageError};
use crate::records::{Employee, EmployeeStatus, Project};

/// Employees keyed by `employee_id`, persisted as one JSON object.
/// Maintained by employee management; the ledger only reads it and flips status.
pub struct EmployeeIndex {
    storage: Arc<dyn LocalStorage>,
    write_lock: Mutex<()>,
}

impl EmployeeIndex {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    /// Accepts both the keyed object form and a plain list.
    pub fn all(&self) -> BTreeMap<String, Employee> {
        let raw = match self.storage.get_item(keys::EMPLOYEES) {
            Ok(Some(raw)) => raw,
            Ok(None) => return BTreeMap::new(),
            Err(e) => {
                warn!("Failed to read employee index: {}", e);
                return BTreeMap::new();
            }
        };
        let rows: Vec<Value> = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map.into_iter().map(|(_, row)| row).collect(),
            Ok(Value::Array(rows)) => rows,
            Ok(_) | Err(_) => {
                warn!("Employee index is not an object or list, ignoring it");
                return BTreeMap::new();
            }
        };
        rows.into_iter()
            .filter_map(|row| match serde_json::from_value::<Employee>(row) {
                Ok(employee) => Some((employee.employee_id.clone(), employee)),
                Err(e) => {
                    warn!("Skipping malformed employee entry: {}", e);
                    None
                }
            })
            .collect()
    }

    pub fn get(&self, employee_id: &str) -> Option<Employee> {
        self.all().remove(employee_id)
    }

    /// Employees of one project in `emp_code` order.
    pub fn for_project(&self, project_id: &str) -> Vec<Employee> {
        let mut employees: Vec<Employee> = self
            .all()
            .into_values()
            .filter(|employee| employee.project_id == project_id)
            .collect();
        employees.sort_by(|a, b| compare_emp_codes(&a.emp_code, &b.emp_code));
        employees
    }

    /// Stored index as JSON, always an object or a list. Only whole-index
    /// corruption is an error; odd entries are left as they are.
    fn read_raw(&self) -> Result<Value, StorageError> {
        let Some(raw) = self.storage.get_item(keys::EMPLOYEES)? else {
            return Ok(Value::Object(Map::new()));
        };
        match serde_json::from_str::<Value>(&raw)? {
            index @ (Value::Object(_) | Value::Array(_)) => Ok(index),
            _ => {
                warn!("Employee index is not an object or list, starting a new one");
                Ok(Value::Object(Map::new()))
            }
        }
    }

    fn entry_mut<'a>(index: &'a mut Value, employee_id: &str) -> Option<&'a mut Value> {
        match index {
            Value::Object(map) => {
                if map.get(employee_id).map_or(false, Value::is_object) {
                    return map.get_mut(employee_id);
                }
                map.values_mut().find(|row| has_employee_id(row, employee_id))
            }
            Value::Array(rows) => rows.iter_mut().find(|row| has_employee_id(row, employee_id)),
            _ => None,
        }
    }

    /// Writes the modelled fields of `employee`, keeping any others already stored.
    pub fn upsert(&self, employee: &Employee) -> Result<(), StorageError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| StorageError::Lock(e.to_string()))?;
        let mut index = self.read_raw()?;
        let row = serde_json::to_value(employee)?;
        match Self::entry_mut(&mut index, &employee.employee_id) {
            Some(existing) => merge_row(existing, row),
            None => match &mut index {
                Value::Array(rows) => rows.push(row),
                Value::Object(map) => {
                    map.insert(employee.employee_id.clone(), row);
                }
                _ => {}
            },
        }
        write_json(self.storage.as_ref(), keys::EMPLOYEES, &index)?;
        debug!("Stored employee {} ({})", employee.employee_id, employee.emp_name);
        Ok(())
    }

    /// Returns the updated employee, or `None` when the id is unknown.
    /// Only the `status` field of the stored entry is touched.
    pub fn set_status(
        &self,
        employee_id: &str,
        status: EmployeeStatus,
    ) -> Result<Option<Employee>, StorageError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| StorageError::Lock(e.to_string()))?;
        let mut index = self.read_raw()?;
        let Some(entry) = Self::entry_mut(&mut index, employee_id) else {
            return Ok(None);
        };
        let mut employee = match serde_json::from_value::<Employee>(entry.clone()) {
            Ok(employee) => employee,
            Err(e) => {
                warn!("Employee {} is malformed, status left unchanged: {}", employee_id, e);
                return Ok(None);
            }
        };
        let Value::Object(fields) = entry else {
            return Ok(None);
        };
        fields.insert("status".to_string(), serde_json::to_value(status)?);
        employee.status = status;
        write_json(self.storage.as_ref(), keys::EMPLOYEES, &index)?;
        debug!("Employee {} is now {:?}", employee_id, status);
        Ok(Some(employee))
    }
}

fn has_employee_id(row: &Value, employee_id: &str) -> bool {
    row.get("employee_id").and_then(Value::as_str) == Some(employee_id)
}

fn merge_row(existing: &mut Value, row: Value) {
    match (existing, row) {
        (Value::Object(fields), Value::Object(updates)) => fields.extend(updates),
        (existing, row) => *existing = row,
    }
}

/// Projects visible to one user, stored under `projects_<user_id>`.
pub struct ProjectCache {
    storage: Arc<dyn LocalStorage>,
    user_id: String,
}

impl ProjectCache {
    pub fn new(storage: Arc<dyn LocalStorage>, user_id: &str) -> Self {
        Self {
            storage,
            user_id: user_id.to_string(),
        }
    }

    fn key(&self) -> String {
        keys::projects(&self.user_id)
    }

    pub fn all(&self) -> Vec<Project> {
        let raw = match self.storage.get_item(&self.key()) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("Failed to read project cache for {}: {}", self.user_id, e);
                return Vec::new();
            }
        };
        match serde_json::from_str::<Vec<Value>>(&raw) {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|row| serde_json::from_value::<Project>(row).ok())
                .collect(),
            Err(e) => {
                warn!("Project cache for {} is not a list: {}", self.user_id, e);
                Vec::new()
            }
        }
    }

    pub fn get(&self, project_id: &str) -> Option<Project> {
        self.all()
            .into_iter()
            .find(|project| project.project_id == project_id)
    }

    pub fn upsert(&self, project: &Project) -> Result<(), StorageError> {
        let mut projects = self.all();
        projects.retain(|existing| existing.project_id != project.project_id);
        projects.push(project.clone());
        write_json(self.storage.as_ref(), &self.key(), &projects)
    }
}
