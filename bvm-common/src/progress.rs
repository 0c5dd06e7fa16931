//! Prompt × provider progress matrix and global percent weighting
//!
//! The matrix tracks one cell per (prompt, provider) unit of work during the
//! analyzing-prompts stage. Providers complete asynchronously and out of
//! order, so the global percent for that stage is counted from resolved cells
//! rather than trusted from the server; later stages self-report but are
//! clamped so the derived percent never regresses.

use crate::events::Stage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Completion status of one (prompt, provider) cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl CellStatus {
    /// Terminal statuses never change again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CellStatus::Completed | CellStatus::Failed | CellStatus::Skipped
        )
    }

    /// Resolved cells count toward the completed-cell numerator
    pub fn is_resolved(self) -> bool {
        self.is_terminal()
    }
}

/// Prompt × provider grid of per-unit completion status
///
/// Rows are keyed by the normalized (trimmed) prompt string. A row is seeded
/// with one pending cell per currently-known provider; cells for providers
/// first seen in a status event are created lazily.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressMatrix {
    prompts: Vec<String>,
    providers: Vec<String>,
    cells: HashMap<(String, String), CellStatus>,
}

fn normalize(prompt: &str) -> String {
    prompt.trim().to_string()
}

impl ProgressMatrix {
    pub fn new(providers: &[String]) -> Self {
        Self {
            prompts: Vec::new(),
            providers: providers.to_vec(),
            cells: HashMap::new(),
        }
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    pub fn providers(&self) -> &[String] {
        &self.providers
    }

    /// Seed a row for a newly-announced prompt
    ///
    /// Returns false without touching the matrix when the prompt is already
    /// known (the normalized form is the identity).
    pub fn seed_prompt(&mut self, prompt: &str) -> bool {
        let prompt = normalize(prompt);
        if prompt.is_empty() || self.prompts.contains(&prompt) {
            return false;
        }
        for provider in &self.providers {
            self.cells
                .insert((prompt.clone(), provider.clone()), CellStatus::Pending);
        }
        self.prompts.push(prompt);
        true
    }

    /// Add a provider column, seeding pending cells for every known prompt
    fn add_provider(&mut self, provider: &str) {
        let provider = provider.to_string();
        for prompt in &self.prompts {
            self.cells
                .entry((prompt.clone(), provider.clone()))
                .or_insert(CellStatus::Pending);
        }
        self.providers.push(provider);
    }

    /// Set the status of one cell, enforcing the cell lifecycle
    ///
    /// Unknown prompts/providers are created lazily. A cell that has reached
    /// a terminal status keeps it; a non-pending cell never returns to
    /// pending. Returns true when the stored status changed.
    pub fn set_status(&mut self, prompt: &str, provider: &str, status: CellStatus) -> bool {
        let prompt = normalize(prompt);
        if prompt.is_empty() {
            return false;
        }
        if !self.prompts.contains(&prompt) {
            self.seed_prompt(&prompt);
        }
        if !self.providers.iter().any(|p| p == provider) {
            self.add_provider(provider);
        }

        let key = (prompt, provider.to_string());
        let current = self
            .cells
            .get(&key)
            .copied()
            .unwrap_or(CellStatus::Pending);
        if current.is_terminal() {
            return false;
        }
        if status == CellStatus::Pending && current != CellStatus::Pending {
            return false;
        }
        if current == status {
            return false;
        }
        self.cells.insert(key, status);
        true
    }

    pub fn status(&self, prompt: &str, provider: &str) -> Option<CellStatus> {
        self.cells
            .get(&(normalize(prompt), provider.to_string()))
            .copied()
    }

    pub fn total_cells(&self) -> usize {
        self.prompts.len() * self.providers.len()
    }

    /// Cells no longer pending/running
    pub fn resolved_cells(&self) -> usize {
        self.cells.values().filter(|s| s.is_resolved()).count()
    }

    /// True once every cell has reached a terminal status
    pub fn is_fully_resolved(&self) -> bool {
        self.total_cells() > 0 && self.resolved_cells() == self.total_cells()
    }
}

/// Compute the global percent for a stage (pure function)
///
/// - analyzing-prompts: resolved/total cells mapped onto 0-70
/// - extracting-brands: reported value, floored at 70
/// - calculating-scores: reported value, floored at 90
/// - anything else: reported value unchanged
///
/// The result is capped at 100; the analyzing-prompts branch handles the
/// empty matrix (0 prompts × 0 providers yields 0).
pub fn global_percent(stage: Stage, stage_progress: u8, matrix: &ProgressMatrix) -> u8 {
    let percent = match stage {
        Stage::AnalyzingPrompts => {
            let total = matrix.total_cells();
            if total == 0 {
                0
            } else {
                let scaled = (70.0 * matrix.resolved_cells() as f64 / total as f64).round() as u8;
                scaled.min(70)
            }
        }
        Stage::ExtractingBrands => stage_progress.max(70),
        Stage::CalculatingScores => stage_progress.max(90),
        _ => stage_progress,
    };
    percent.min(100)
}

/// Percent for one per-competitor scoring tick
pub fn scoring_percent(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 90;
    }
    let tick = (10.0 * index as f64 / total as f64).round() as u8;
    (90 + tick).min(100)
}
