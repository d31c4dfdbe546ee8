// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tab bookkeeping within one session's browser context.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use predator_driver::{ContextDriver, DriverResult, PageDriver};

/// Summary of one open tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    /// Stable tab id within the session.
    pub tab_id: String,
    /// Current URL.
    pub url: String,
    /// Page title, best effort.
    pub title: String,
    /// Whether this is the active tab.
    pub is_active: bool,
}

/// Tracks pages as tabs with one active pointer.
pub struct TabManager {
    context: Arc<dyn ContextDriver>,
    pages: BTreeMap<String, Arc<dyn PageDriver>>,
    active_tab_id: String,
    next_index: u64,
    default_timeout: Duration,
}

impl std::fmt::Debug for TabManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabManager")
            .field("tabs", &self.pages.keys().collect::<Vec<_>>())
            .field("active_tab_id", &self.active_tab_id)
            .finish()
    }
}

impl TabManager {
    /// Start with an initial page as the active tab.
    #[must_use]
    pub fn new(
        context: Arc<dyn ContextDriver>,
        initial_page: Arc<dyn PageDriver>,
        default_timeout: Duration,
    ) -> Self {
        let mut manager = Self {
            context,
            pages: BTreeMap::new(),
            active_tab_id: String::new(),
            next_index: 0,
            default_timeout,
        };
        manager.active_tab_id = manager.register(initial_page);
        manager
    }

    fn register(&mut self, page: Arc<dyn PageDriver>) -> String {
        let tab_id = format!("tab_{}", self.next_index);
        self.next_index += 1;
        self.pages.insert(tab_id.clone(), page);
        tab_id
    }

    /// Open a new tab at `url` and make it active.
    ///
    /// # Errors
    ///
    /// Returns the driver error if the page cannot be created or navigated.
    pub async fn open_tab(&mut self, url: &str) -> DriverResult<String> {
        let page = self.context.new_page().await?;
        page.goto(url, self.default_timeout).await?;
        let tab_id = self.register(page);
        self.active_tab_id = tab_id.clone();
        Ok(tab_id)
    }

    /// The page behind a tab id, or the active tab when `None`.
    ///
    /// # Errors
    ///
    /// Returns [`predator_driver::DriverError::TargetNotFound`] for an
    /// unknown tab id.
    pub fn get_page(&self, tab_id: Option<&str>) -> DriverResult<Arc<dyn PageDriver>> {
        let key = tab_id.unwrap_or(&self.active_tab_id);
        self.pages
            .get(key)
            .cloned()
            .ok_or_else(|| predator_driver::DriverError::TargetNotFound(format!("tab {key}")))
    }

    /// Make a tab active.
    ///
    /// # Errors
    ///
    /// Returns [`predator_driver::DriverError::TargetNotFound`] for an
    /// unknown tab id.
    pub fn set_active_tab(&mut self, tab_id: &str) -> DriverResult<()> {
        if !self.pages.contains_key(tab_id) {
            return Err(predator_driver::DriverError::TargetNotFound(format!(
                "tab {tab_id}"
            )));
        }
        self.active_tab_id = tab_id.to_string();
        Ok(())
    }

    /// The active tab id.
    #[must_use]
    pub fn active_tab_id(&self) -> &str {
        &self.active_tab_id
    }

    /// Summaries of all open tabs.
    pub async fn list_tabs(&self) -> Vec<TabInfo> {
        let mut tabs = Vec::with_capacity(self.pages.len());
        for (tab_id, page) in &self.pages {
            let title = page.title().await.unwrap_or_default();
            tabs.push(TabInfo {
                tab_id: tab_id.clone(),
                url: page.current_url(),
                title,
                is_active: tab_id == &self.active_tab_id,
            });
        }
        tabs
    }
}
