//! Employee directory collaborator (read-only)

use crate::error::DirectoryError;
use crate::types::EmployeeId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Shared reference to an employee directory
pub type SharedDirectory = Arc<dyn EmployeeDirectory>;

/// Answers whether an employee currently receives alerts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmployeeDirectory: Send + Sync {
    /// Whether the employee is active (inactive = day off, leave)
    async fn is_active(&self, employee: EmployeeId) -> Result<bool, DirectoryError>;
}

/// In-process directory
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    employees: DashMap<EmployeeId, bool>,
}

impl InMemoryDirectory {
    /// Create empty directory
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory with the given employees, all active
    #[must_use]
    pub fn with_active(employees: impl IntoIterator<Item = EmployeeId>) -> Self {
        let dir = Self::new();
        for employee in employees {
            dir.set_active(employee, true);
        }
        dir
    }

    /// Add or update an employee
    pub fn set_active(&self, employee: EmployeeId, active: bool) {
        self.employees.insert(employee, active);
    }

    /// Remove an employee
    pub fn remove(&self, employee: EmployeeId) {
        self.employees.remove(&employee);
    }
}

#[async_trait]
impl EmployeeDirectory for InMemoryDirectory {
    async fn is_active(&self, employee: EmployeeId) -> Result<bool, DirectoryError> {
        self.employees
            .get(&employee)
            .map(|e| *e.value())
            .ok_or(DirectoryError::NotFound(employee))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_tracks_activity() {
        let dir = InMemoryDirectory::with_active([EmployeeId(1)]);
        assert!(dir.is_active(EmployeeId(1)).await.unwrap());

        dir.set_active(EmployeeId(1), false);
        assert!(!dir.is_active(EmployeeId(1)).await.unwrap());

        dir.remove(EmployeeId(1));
        assert!(matches!(
            dir.is_active(EmployeeId(1)).await,
            Err(DirectoryError::NotFound(_))
        ));
    }
}
