//! File tools: save, read and list files under the working directory
//!
//! Which files the model may list is governed by the agent instructions,
//! not by these tools.

use super::{contained_path, Tool, ToolResult};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use walkdir::WalkDir;

/// Tool for reading file contents
pub struct ReadFileTool {
    base_dir: PathBuf,
}

impl ReadFileTool {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Reads the contents of the file `file_name` and returns the contents if successful."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_name": {
                    "type": "string",
                    "description": "The name of the file to read, relative to the working directory"
                }
            },
            "required": ["file_name"]
        })
    }

    async fn execute(&self, params: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Params {
            file_name: String,
        }

        let params: Params = serde_json::from_value(params)?;
        let Some(path) = contained_path(&self.base_dir, &params.file_name) else {
            return Ok(ToolResult::error(
                "Access denied: path outside working directory",
            ));
        };

        tracing::debug!("Reading file: {}", path.display());
        // Use lossy UTF-8 conversion to handle files with invalid encoding
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(ToolResult::success(
                String::from_utf8_lossy(&bytes).into_owned(),
            )),
            Err(e) => Ok(ToolResult::error(format!(
                "Error reading file {}: {}",
                params.file_name, e
            ))),
        }
    }
}

/// Tool for saving contents to a file
pub struct SaveFileTool {
    base_dir: PathBuf,
}

impl SaveFileTool {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }
}

#[async_trait]
impl Tool for SaveFileTool {
    fn name(&self) -> &str {
        "save_file"
    }

    fn description(&self) -> &str {
        "Saves the contents to a file called `file_name` and returns the file name if successful."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "contents": {
                    "type": "string",
                    "description": "The contents to save"
                },
                "file_name": {
                    "type": "string",
                    "description": "The name of the file to save to, relative to the working directory"
                },
                "overwrite": {
                    "type": "boolean",
                    "description": "Overwrite the file if it already exists (default: true)"
                }
            },
            "required": ["contents", "file_name"]
        })
    }

    async fn execute(&self, params: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Params {
            contents: String,
            file_name: String,
            #[serde(default = "default_overwrite")]
            overwrite: bool,
        }

        fn default_overwrite() -> bool {
            true
        }

        let params: Params = serde_json::from_value(params)?;
        let Some(path) = contained_path(&self.base_dir, &params.file_name) else {
            return Ok(ToolResult::error(
                "Access denied: path outside working directory",
            ));
        };

        if path.exists() && !params.overwrite {
            return Ok(ToolResult::error(format!(
                "File {} already exists",
                params.file_name
            )));
        }

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Ok(ToolResult::error(format!(
                    "Failed to create directories: {}",
                    e
                )));
            }
        }

        match tokio::fs::write(&path, &params.contents).await {
            Ok(()) => {
                tracing::info!("Saved: {}", path.display());
                Ok(ToolResult::success(params.file_name))
            }
            Err(e) => Ok(ToolResult::error(format!("Error saving to file: {}", e))),
        }
    }
}

/// Tool for listing the files in the working directory
pub struct ListFilesTool {
    base_dir: PathBuf,
}

impl ListFilesTool {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn list(&self) -> Vec<String> {
        WalkDir::new(&self.base_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                e.path()
                    .strip_prefix(&self.base_dir)
                    .ok()
                    .map(|p| p.to_string_lossy().into_owned())
            })
            .collect()
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "Returns a list of files in the working directory."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(&self, _params: Value) -> Result<ToolResult> {
        let files = self.list();
        tracing::debug!(count = files.len(), "Listed files");
        Ok(ToolResult::success(serde_json::to_string_pretty(&files)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_then_read() {
        let dir = TempDir::new().unwrap();
        let save = SaveFileTool::new(dir.path().to_path_buf());
        let read = ReadFileTool::new(dir.path().to_path_buf());

        let result = save
            .execute(json!({"contents": "a,b\n1,2\n", "file_name": "out/data.csv"}))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, "out/data.csv");

        let result = read
            .execute(json!({"file_name": "out/data.csv"}))
            .await
            .unwrap();
        assert_eq!(result.output, "a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_save_respects_overwrite_flag() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("keep.json"), "[]").unwrap();
        let save = SaveFileTool::new(dir.path().to_path_buf());

        let result = save
            .execute(json!({"contents": "{}", "file_name": "keep.json", "overwrite": false}))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("keep.json")).unwrap(),
            "[]"
        );
    }

    #[tokio::test]
    async fn test_paths_outside_base_rejected() {
        let dir = TempDir::new().unwrap();
        let read = ReadFileTool::new(dir.path().to_path_buf());

        for name in ["../secret.txt", "/etc/hostname"] {
            let result = read.execute(json!({ "file_name": name })).await.unwrap();
            assert!(!result.success, "{name} should be rejected");
            assert!(result.output.contains("Access denied"));
        }
    }

    #[tokio::test]
    async fn test_read_missing_file_is_error_result() {
        let dir = TempDir::new().unwrap();
        let read = ReadFileTool::new(dir.path().to_path_buf());
        let result = read
            .execute(json!({"file_name": "missing.csv"}))
            .await
            .unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_list_files_is_flat_and_sorted() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.json"), "[]").unwrap();
        std::fs::write(dir.path().join("a.csv"), "x\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested/c.csv"), "").unwrap();

        let list = ListFilesTool::new(dir.path().to_path_buf());
        let result = list.execute(json!({})).await.unwrap();
        let files: Vec<String> = serde_json::from_str(&result.output).unwrap();
        // Listing is unfiltered; the instructions narrow what the model reports
        assert_eq!(files, vec!["a.csv", "b.json", "notes.txt"]);
    }
}
