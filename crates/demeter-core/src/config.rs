//! Crawl-task configuration: named tasks bound to URL templates.
//!
//! Loaded once at startup from a JSON file and shared read-only. A task
//! references a template by name and supplies substitution parameters;
//! `build_url` resolves `{placeholder}` segments and fails with a
//! descriptive error when a referenced template is missing.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::CrawlTask;

/// One configured crawl target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub task_id: String,
    pub template: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// Detail template used for the per-book fan-out of this task.
    #[serde(default)]
    pub detail_template: Option<String>,
}

/// The full crawl configuration: URL templates plus task definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlConfig {
    pub url_templates: HashMap<String, String>,
    pub tasks: Vec<TaskConfig>,
}

impl CrawlConfig {
    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: CrawlConfig = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    /// All configured task ids, in declaration order.
    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.task_id.clone()).collect()
    }

    /// Resolve a task's page URL from its template and parameters.
    pub fn build_url(&self, task: &TaskConfig) -> Result<String, AppError> {
        let template = self.url_templates.get(&task.template).ok_or_else(|| {
            AppError::Config(format!(
                "URL template '{}' referenced by task '{}' is not defined",
                task.template, task.task_id
            ))
        })?;
        Ok(substitute(template, &task.params))
    }

    /// Resolve the detail URL for one book of a task. The `book_id`
    /// parameter is always available to the template.
    pub fn build_detail_url(&self, task: &TaskConfig, book_id: &str) -> Result<String, AppError> {
        let name = task.detail_template.as_deref().ok_or_else(|| {
            AppError::Config(format!("task '{}' has no detail template", task.task_id))
        })?;
        let template = self.url_templates.get(name).ok_or_else(|| {
            AppError::Config(format!(
                "detail template '{name}' referenced by task '{}' is not defined",
                task.task_id
            ))
        })?;
        let mut params = task.params.clone();
        params.insert("book_id".to_string(), book_id.to_string());
        Ok(substitute(template, &params))
    }

    /// Resolve a task into an immutable [`CrawlTask`] reference.
    pub fn resolve(&self, task_id: &str) -> Result<CrawlTask, AppError> {
        let task = self
            .task(task_id)
            .ok_or_else(|| AppError::UnknownTask(task_id.to_string()))?;
        let url = self.build_url(task)?;
        let mut params: Vec<(String, String)> = task
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        params.sort();
        Ok(CrawlTask {
            task_id: task.task_id.clone(),
            url,
            params,
        })
    }
}

fn substitute(template: &str, params: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in params {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> CrawlConfig {
        serde_json::from_value(serde_json::json!({
            "url_templates": {
                "ranking_page": "https://api.example.com/rank/{channel}?page={page}",
                "book_detail": "https://api.example.com/book/{book_id}"
            },
            "tasks": [
                {
                    "task_id": "fantasy-daily",
                    "template": "ranking_page",
                    "params": {"channel": "fantasy", "page": "1"},
                    "detail_template": "book_detail"
                },
                {
                    "task_id": "broken",
                    "template": "missing_template"
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_build_url_substitutes_params() {
        let config = sample_config();
        let task = config.task("fantasy-daily").unwrap();
        assert_eq!(
            config.build_url(task).unwrap(),
            "https://api.example.com/rank/fantasy?page=1"
        );
    }

    #[test]
    fn test_missing_template_is_descriptive() {
        let config = sample_config();
        let task = config.task("broken").unwrap();
        let err = config.build_url(task).unwrap_err();
        assert!(err.to_string().contains("missing_template"));
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_detail_url_includes_book_id() {
        let config = sample_config();
        let task = config.task("fantasy-daily").unwrap();
        assert_eq!(
            config.build_detail_url(task, "4217").unwrap(),
            "https://api.example.com/book/4217"
        );
    }

    #[test]
    fn test_resolve_unknown_task() {
        let config = sample_config();
        let err = config.resolve("nope").unwrap_err();
        assert!(matches!(err, AppError::UnknownTask(_)));
    }

    #[test]
    fn test_resolve_builds_immutable_task() {
        let config = sample_config();
        let task = config.resolve("fantasy-daily").unwrap();
        assert_eq!(task.task_id, "fantasy-daily");
        assert_eq!(task.url, "https://api.example.com/rank/fantasy?page=1");
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crawl.json");
        std::fs::write(
            &path,
            serde_json::to_string(&sample_config()).unwrap(),
        )
        .unwrap();
        let loaded = CrawlConfig::from_file(&path).unwrap();
        assert_eq!(loaded.tasks.len(), 2);
    }
}
