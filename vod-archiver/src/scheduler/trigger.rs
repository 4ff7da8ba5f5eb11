//! Administrative triggers for the catalog jobs.
//!
//! Both operations take an optional channel; without one they act on the
//! only configured channel.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::catalog::{BackfillReport, CatalogBackfillJob, CatalogError};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("A channel must be given when {0} channels are configured")]
    AmbiguousChannel(usize),

    #[error("No channels with catalog backfill enabled")]
    NoChannels,

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Entry point for operator-triggered catalog runs.
#[derive(Clone, Default)]
pub struct AdminHandle {
    catalogs: BTreeMap<String, Arc<CatalogBackfillJob>>,
}

impl AdminHandle {
    pub fn new(catalogs: BTreeMap<String, Arc<CatalogBackfillJob>>) -> Self {
        Self { catalogs }
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.catalogs.keys().map(String::as_str)
    }

    fn resolve(&self, channel: Option<&str>) -> Result<&Arc<CatalogBackfillJob>, TriggerError> {
        match channel {
            Some(name) => self
                .catalogs
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, job)| job)
                .ok_or_else(|| TriggerError::UnknownChannel(name.to_string())),
            None => {
                let mut jobs = self.catalogs.values();
                match (jobs.next(), jobs.next()) {
                    (Some(job), None) => Ok(job),
                    (None, _) => Err(TriggerError::NoChannels),
                    (Some(_), Some(_)) => Err(TriggerError::AmbiguousChannel(self.catalogs.len())),
                }
            }
        }
    }

    /// Run a catalog scan now.
    pub async fn trigger_scan(&self, channel: Option<&str>) -> Result<BackfillReport, TriggerError> {
        let job = self.resolve(channel)?;
        Ok(job.trigger_scan().await?)
    }

    /// Page through history now, inserting at most `max_items` VODs.
    pub async fn trigger_backfill(
        &self,
        channel: Option<&str>,
        max_items: u64,
    ) -> Result<BackfillReport, TriggerError> {
        let job = self.resolve(channel)?;
        Ok(job.trigger_backfill(max_items).await?)
    }
}
