//! Workflow Memory
//!
//! Natural-language task guidance kept per website in
//! `workflows/<website>.txt`. Each workflow starts with a `Task:` line
//! followed by its action trajectory. New workflows are merged through a
//! [`WorkflowComparator`]: when a new workflow covers the same task as an
//! existing one, only the better of the two is kept.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::skills::parser::extract_code_pieces;
use crate::skills::store::atomic_write;

const WORKFLOW_FENCE: &str = "\"\"\"";
const TASK_MARKER: &str = "Task:";

/// Preferred side of two overlapping workflows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference {
    New,
    Existing,
    /// The comparator gave no usable answer
    Undecided,
}

/// Judges pairs of workflows
#[async_trait]
pub trait WorkflowComparator: Send + Sync {
    /// Whether two workflow names describe the same task
    async fn same_task(&self, new_name: &str, existing_name: &str) -> Result<bool>;

    async fn better(&self, new: &str, existing: &str) -> Result<Preference>;
}

/// Workflow blocks of a model response
pub fn extract_workflows(response: &str) -> Vec<String> {
    extract_code_pieces(response, WORKFLOW_FENCE, WORKFLOW_FENCE)
        .into_iter()
        .filter(|w| w.contains("Task") && w.contains("Action Trajectory"))
        .collect()
}

/// Split a memory file into workflows, each starting with `Task:`
pub fn split_memory(content: &str) -> Vec<String> {
    content
        .split(TASK_MARKER)
        .filter(|w| !w.is_empty())
        .map(|w| format!("{}{}", TASK_MARKER, w).trim().to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

/// First line without its `Task: ` prefix
pub fn workflow_name(workflow: &str) -> String {
    let first = workflow.split('\n').next().unwrap_or_default().trim();
    first.strip_prefix(TASK_MARKER).unwrap_or(first).trim().to_string()
}

/// Workflow memory file of one website
#[derive(Debug, Clone)]
pub struct WorkflowMemory {
    path: PathBuf,
}

impl WorkflowMemory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<dir>/<website>.txt`
    pub fn for_website(dir: &Path, website: &str) -> Self {
        Self::new(dir.join(format!("{}.txt", website)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current content; empty when the file does not exist yet
    pub fn read(&self) -> Result<String> {
        if !self.path.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read workflows: {}", self.path.display()))
    }

    pub fn workflows(&self) -> Result<Vec<String>> {
        Ok(split_memory(&self.read()?))
    }

    /// Append raw text followed by a blank line
    pub fn append(&self, text: &str) -> Result<()> {
        let content = format!("{}{}\n\n", self.read()?, text);
        atomic_write(&self.path, &content)
            .with_context(|| format!("Failed to write workflows: {}", self.path.display()))
    }

    /// Merge the workflows of `response` and rewrite the file
    ///
    /// Returns the number of workflows added.
    pub async fn merge_response(&self, response: &str, comparator: &dyn WorkflowComparator) -> Result<usize> {
        let incoming = extract_workflows(response);
        let mut existing = self.workflows()?;
        let mut added = Vec::new();

        for workflow in incoming {
            match find_overlap(&workflow, &existing, comparator).await? {
                None => {
                    debug!(name = %workflow_name(&workflow), "New workflow");
                    added.push(workflow);
                }
                Some((index, Preference::New)) => {
                    let replaced = existing.remove(index);
                    info!(new = %workflow_name(&workflow), old = %workflow_name(&replaced), "Replacing workflow");
                    added.push(workflow);
                }
                Some((index, _)) => {
                    info!(new = %workflow_name(&workflow), kept = %workflow_name(&existing[index]), "Keeping existing workflow");
                }
            }
        }

        let count = added.len();
        existing.extend(added);
        atomic_write(&self.path, &existing.join("\n\n"))
            .with_context(|| format!("Failed to write workflows: {}", self.path.display()))?;
        info!(path = %self.path.display(), added = count, total = existing.len(), "Rewrote workflow memory");
        Ok(count)
    }
}

/// First existing workflow for the same task, with the preferred side
async fn find_overlap(
    workflow: &str,
    existing: &[String],
    comparator: &dyn WorkflowComparator,
) -> Result<Option<(usize, Preference)>> {
    let name = workflow_name(workflow);
    for (index, candidate) in existing.iter().enumerate() {
        if comparator.same_task(&name, &workflow_name(candidate)).await? {
            let preference = comparator.better(workflow, candidate).await?;
            return Ok(Some((index, preference)));
        }
    }
    Ok(None)
}

/// `yes` must appear before `no`; missing `yes` counts as position 0
pub fn parse_yes_no(answer: &str) -> bool {
    let yes = answer.find("yes").unwrap_or(0);
    let no = answer.find("no").unwrap_or(answer.len());
    yes < no
}

/// `Workflow 1` is the new workflow, `Workflow 2` the existing one
pub fn parse_preference(answer: &str) -> Preference {
    let lower = answer.to_lowercase();
    if lower.contains("workflow 1") {
        Preference::New
    } else if lower.contains("workflow 2") {
        Preference::Existing
    } else {
        Preference::Undecided
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct ByName {
        prefer_new: Preference,
    }

    #[async_trait]
    impl WorkflowComparator for ByName {
        async fn same_task(&self, new_name: &str, existing_name: &str) -> Result<bool> {
            Ok(new_name == existing_name)
        }

        async fn better(&self, _new: &str, _existing: &str) -> Result<Preference> {
            Ok(self.prefer_new)
        }
    }

    const MEMORY: &str = "Task: Search a product\nAction Trajectory:\n```click('1')```\n\nTask: Open reviews\nAction Trajectory:\n```click('2')```";

    fn response() -> String {
        "Here you go.\n\"\"\"\nTask: Search a product\nAction Trajectory:\n```search_product('1', 'x')```\n\"\"\"\n\"\"\"\nTask: Sort orders\nAction Trajectory:\n```click('9')```\n\"\"\"\n\"\"\"\nnot a workflow\n\"\"\"".to_string()
    }

    #[test]
    fn test_split_and_name() {
        let workflows = split_memory(MEMORY);
        assert_eq!(workflows.len(), 2);
        assert_eq!(workflow_name(&workflows[1]), "Open reviews");
        assert!(split_memory("").is_empty());
    }

    #[test]
    fn test_extract_workflows() {
        let workflows = extract_workflows(&response());
        assert_eq!(workflows.len(), 2);
        assert!(workflows[0].starts_with("Task: Search a product"));
    }

    #[test]
    fn test_answer_parsing() {
        assert!(parse_yes_no("yes"));
        assert!(!parse_yes_no("no"));
        assert!(!parse_yes_no("I say no, not yes"));
        assert_eq!(parse_preference("Workflow 2."), Preference::Existing);
        assert_eq!(parse_preference("workflow 1"), Preference::New);
        assert_eq!(parse_preference("neither"), Preference::Undecided);
    }

    #[tokio::test]
    async fn test_merge_replaces_when_new_is_better() {
        let dir = TempDir::new().unwrap();
        let memory = WorkflowMemory::for_website(dir.path(), "shopping");
        fs::write(memory.path(), MEMORY).unwrap();

        let added = memory
            .merge_response(&response(), &ByName { prefer_new: Preference::New })
            .await
            .unwrap();
        assert_eq!(added, 2);
        let names: Vec<String> = memory.workflows().unwrap().iter().map(|w| workflow_name(w)).collect();
        assert_eq!(names, vec!["Open reviews", "Search a product", "Sort orders"]);
        assert!(memory.read().unwrap().contains("search_product('1', 'x')"));
    }

    #[tokio::test]
    async fn test_merge_keeps_existing_when_undecided() {
        let dir = TempDir::new().unwrap();
        let memory = WorkflowMemory::for_website(dir.path(), "shopping");
        fs::write(memory.path(), MEMORY).unwrap();

        let added = memory
            .merge_response(&response(), &ByName { prefer_new: Preference::Undecided })
            .await
            .unwrap();
        assert_eq!(added, 1);
        let content = memory.read().unwrap();
        assert!(content.contains("```click('1')```"));
        assert!(!content.contains("search_product"));
    }

    #[test]
    fn test_append() {
        let dir = TempDir::new().unwrap();
        let memory = WorkflowMemory::for_website(dir.path(), "map");
        memory.append("def a():\n    pass").unwrap();
        assert_eq!(memory.read().unwrap(), "def a():\n    pass\n\n");
    }
}
