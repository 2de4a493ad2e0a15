use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::TimerInfo;
use crate::persistence::{JsonFile, PersistResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Row {
    key: TimerInfo,
    cron: String,
    fire_at: DateTime<Utc>,
}

/// Pending fire times, persisted so that a restart keeps agreed schedules.
#[derive(Debug, Clone)]
pub struct FireTable {
    file: Option<JsonFile>,
}

impl FireTable {
    pub fn on_disk(file: JsonFile) -> Self {
        Self { file: Some(file) }
    }

    /// A table that forgets everything on restart.
    pub fn volatile() -> Self {
        Self { file: None }
    }

    pub async fn load(&self) -> PersistResult<HashMap<TimerInfo, (String, DateTime<Utc>)>> {
        let Some(file) = &self.file else {
            return Ok(HashMap::new());
        };
        let rows: Vec<Row> = file.load().await?.unwrap_or_default();
        Ok(rows
            .into_iter()
            .map(|row| (row.key, (row.cron, row.fire_at)))
            .collect())
    }

    pub async fn save<'a>(
        &self,
        pending: impl Iterator<Item = (&'a TimerInfo, &'a str, DateTime<Utc>)>,
    ) -> PersistResult<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let mut rows: Vec<Row> = pending
            .map(|(key, cron, fire_at)| Row {
                key: key.clone(),
                cron: cron.to_string(),
                fire_at,
            })
            .collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        file.save(&rows).await
    }
}
