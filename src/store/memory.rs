/// In-process anomaly store.
///
/// Holds every row in a `Mutex`-guarded vector shared by all clones of the
/// repository, so concurrent runs on separate threads see one store. The
/// whole supersede-then-insert step runs under the lock, which gives the
/// same per-key atomicity as the database transaction.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use super::{AnomalyRepository, NewAnomaly, StoreError};
use crate::model::{AnomalyRecord, SeriesKey};
use crate::query::AnomalyQuery;

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    rows: Vec<AnomalyRecord>,
    read_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRepository {
    state: Arc<Mutex<State>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maintenance mode. While set, `replace_active` fails with
    /// `StoreError::ReadOnly` and leaves every batch as it was; `find` and
    /// `get` keep serving the current rows. Embedders use it to freeze the
    /// store while they snapshot or migrate it.
    pub fn set_read_only(&self, read_only: bool) -> Result<(), StoreError> {
        self.lock()?.read_only = read_only;
        Ok(())
    }

    /// Every stored row, in insertion order.
    pub fn all_rows(&self) -> Result<Vec<AnomalyRecord>, StoreError> {
        Ok(self.lock()?.rows.clone())
    }

    pub fn active_rows(&self, key: &SeriesKey) -> Result<Vec<AnomalyRecord>, StoreError> {
        Ok(self
            .lock()?
            .rows
            .iter()
            .filter(|r| r.is_active && &r.series_key() == key)
            .cloned()
            .collect())
    }

    pub fn is_read_only(&self) -> Result<bool, StoreError> {
        Ok(self.lock()?.read_only)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl AnomalyRepository for MemoryRepository {
    fn replace_active(&mut self, key: &SeriesKey, rows: &[NewAnomaly]) -> Result<Vec<i64>, StoreError> {
        let mut state = self.lock()?;
        if state.read_only {
            return Err(StoreError::ReadOnly);
        }

        let created_at = Utc::now();
        for existing in state.rows.iter_mut().filter(|r| r.is_active) {
            if &existing.series_key() == key {
                existing.is_active = false;
            }
        }

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            state.next_id += 1;
            let id = state.next_id;
            state.rows.push(AnomalyRecord {
                id,
                group_value: row.group_value.clone(),
                group_field_name: key.group_field.clone(),
                period_type: key.period_type,
                object_type: key.object_type.clone(),
                object_id: key.object_id.clone(),
                object_name: key.object_name.clone(),
                district: key.district,
                comparison_mean: row.comparison_mean,
                recent_mean: row.recent_mean,
                difference: row.difference,
                std_dev: row.std_dev,
                out_of_bounds: row.out_of_bounds,
                comparison_dates: row.comparison_dates.clone(),
                comparison_counts: row.comparison_counts.clone(),
                recent_dates: row.recent_dates.clone(),
                recent_counts: row.recent_counts.clone(),
                metadata: row.metadata.clone(),
                is_active: true,
                created_at,
            });
            ids.push(id);
        }
        Ok(ids)
    }

    fn find(&mut self, query: &AnomalyQuery) -> Result<Vec<AnomalyRecord>, StoreError> {
        let state = self.lock()?;
        let mut matches: Vec<AnomalyRecord> = state.rows.iter().filter(|r| query.matches(r)).cloned().collect();
        drop(state);

        matches.sort_by(|a, b| query.query_type.compare(a, b));
        if let Some(limit) = query.limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    fn get(&mut self, id: i64) -> Result<Option<AnomalyRecord>, StoreError> {
        Ok(self.lock()?.rows.iter().find(|r| r.id == id).cloned())
    }
}
