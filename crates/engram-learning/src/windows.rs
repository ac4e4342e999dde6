//! Window service
//!
//! Joins the interaction repository with the pure window assembly in
//! `engram-core`, producing extractor inputs for each run mode.

use engram_core::{
    incremental_window, manual_window, rerun_chunks, InteractionFilter, InteractionRepository,
    Window, WindowItem, WindowMode,
};
use engram_types::Result;
use std::sync::Arc;

pub struct WindowService {
    interactions: Arc<dyn InteractionRepository>,
}

impl WindowService {
    pub fn new(interactions: Arc<dyn InteractionRepository>) -> Self {
        Self { interactions }
    }

    async fn history(&self, org_id: &str, filter: &InteractionFilter) -> Result<Vec<WindowItem>> {
        Ok(self
            .interactions
            .windowed_history(org_id, filter)
            .await?
            .into_iter()
            .map(|(interaction, request)| WindowItem {
                interaction,
                request,
            })
            .collect())
    }

    /// The incremental window for a scope, if one is due
    pub async fn incremental(
        &self,
        org_id: &str,
        filter: &InteractionFilter,
        window_size: usize,
        stride: usize,
    ) -> Result<Option<Window>> {
        let items = self.history(org_id, filter).await?;
        Ok(incremental_window(&items, window_size, stride))
    }

    /// Every matching interaction, chunked for a rerun
    pub async fn rerun(
        &self,
        org_id: &str,
        filter: &InteractionFilter,
        window_size: usize,
    ) -> Result<Vec<Window>> {
        let items = self.history(org_id, filter).await?;
        Ok(rerun_chunks(&items, window_size))
    }

    /// The single newest window for a manual trigger
    pub async fn manual(
        &self,
        org_id: &str,
        filter: &InteractionFilter,
        window_size: usize,
    ) -> Result<Option<Window>> {
        let items = self.history(org_id, filter).await?;
        Ok(manual_window(&items, window_size))
    }

    /// All interactions of one request, as the success evaluator's input
    pub async fn request_window(&self, org_id: &str, request_id: &str) -> Result<Option<Window>> {
        let filter = InteractionFilter {
            request_id: Some(request_id.to_string()),
            ..InteractionFilter::default()
        };
        let items = self.history(org_id, &filter).await?;
        if items.is_empty() {
            return Ok(None);
        }
        Ok(Some(Window {
            mode: WindowMode::Manual,
            items,
        }))
    }

    /// Distinct users present in the filtered history, for rerun fan-out
    pub async fn distinct_users(
        &self,
        org_id: &str,
        filter: &InteractionFilter,
    ) -> Result<Vec<String>> {
        let items = self.history(org_id, filter).await?;
        let mut users: Vec<String> = items
            .into_iter()
            .map(|item| item.interaction.user_id)
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }

    /// Distinct agent versions in the filtered history, for feedback rerun
    /// fan-out
    pub async fn distinct_agent_versions(
        &self,
        org_id: &str,
        filter: &InteractionFilter,
    ) -> Result<Vec<String>> {
        let items = self.history(org_id, filter).await?;
        let mut versions: Vec<String> = items
            .into_iter()
            .map(|item| item.request.agent_version)
            .collect();
        versions.sort();
        versions.dedup();
        Ok(versions)
    }
}
