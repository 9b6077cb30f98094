//! Operation handlers: the closed set of filesystem mutations the engine
//! can apply inside a sandbox.
//!
//! Dispatch is a lookup table from operation kind to handler function,
//! validated exhaustively when the registry is constructed. All paths are
//! sandbox-relative; absolute paths and parent traversal are rejected so
//! side effects can never land outside the worktree.

use crate::errors::OperationError;
use crate::request::OperationKind;
use anyhow::{bail, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

type Handler = fn(&Path, &serde_json::Value) -> Result<serde_json::Value, OperationError>;

pub struct HandlerRegistry {
    handlers: HashMap<OperationKind, Handler>,
}

impl HandlerRegistry {
    /// Build the registry. Fails at startup if any operation kind is left
    /// without a handler.
    pub fn new() -> Result<Self> {
        let mut handlers: HashMap<OperationKind, Handler> = HashMap::new();
        handlers.insert(OperationKind::WriteFile, write_file);
        handlers.insert(OperationKind::AppendFile, append_file);
        handlers.insert(OperationKind::DeleteFile, delete_file);
        handlers.insert(OperationKind::MoveFile, move_file);
        handlers.insert(OperationKind::MkDir, mk_dir);

        for kind in OperationKind::ALL {
            if !handlers.contains_key(&kind) {
                bail!("No handler registered for operation kind '{kind}'");
            }
        }

        Ok(Self { handlers })
    }

    pub fn dispatch(
        &self,
        kind: OperationKind,
        sandbox_root: &Path,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, OperationError> {
        let handler = self.handlers.get(&kind).ok_or_else(|| {
            OperationError::Other(anyhow::anyhow!("no handler for kind '{kind}'"))
        })?;
        handler(sandbox_root, params)
    }
}

/// Resolve a sandbox-relative path, rejecting anything that could escape.
fn resolve(sandbox_root: &Path, rel: &str) -> Result<PathBuf, OperationError> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Err(OperationError::PathEscape(rel.to_string()));
    }
    for component in rel_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(OperationError::PathEscape(rel.to_string()));
            }
            Component::Normal(_) | Component::CurDir => {}
        }
    }
    Ok(sandbox_root.join(rel_path))
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> OperationError + '_ {
    move |source| OperationError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn parse<T: for<'de> Deserialize<'de>>(params: &serde_json::Value) -> Result<T, OperationError> {
    serde_json::from_value(params.clone()).map_err(|e| OperationError::InvalidParams(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct WriteFileParams {
    path: String,
    content: String,
}

fn write_file(root: &Path, params: &serde_json::Value) -> Result<serde_json::Value, OperationError> {
    let params: WriteFileParams = parse(params)?;
    let target = resolve(root, &params.path)?;
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(&target))?;
    }
    std::fs::write(&target, &params.content).map_err(io_err(&target))?;
    Ok(serde_json::json!({
        "path": params.path,
        "bytes": params.content.len(),
    }))
}

#[derive(Debug, Deserialize)]
struct AppendFileParams {
    path: String,
    content: String,
}

fn append_file(root: &Path, params: &serde_json::Value) -> Result<serde_json::Value, OperationError> {
    use std::io::Write;
    let params: AppendFileParams = parse(params)?;
    let target = resolve(root, &params.path)?;
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(&target))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&target)
        .map_err(io_err(&target))?;
    file.write_all(params.content.as_bytes())
        .map_err(io_err(&target))?;
    Ok(serde_json::json!({
        "path": params.path,
        "bytes": params.content.len(),
    }))
}

#[derive(Debug, Deserialize)]
struct DeleteFileParams {
    path: String,
}

fn delete_file(root: &Path, params: &serde_json::Value) -> Result<serde_json::Value, OperationError> {
    let params: DeleteFileParams = parse(params)?;
    let target = resolve(root, &params.path)?;
    std::fs::remove_file(&target).map_err(io_err(&target))?;
    Ok(serde_json::json!({ "path": params.path }))
}

#[derive(Debug, Deserialize)]
struct MoveFileParams {
    from: String,
    to: String,
}

fn move_file(root: &Path, params: &serde_json::Value) -> Result<serde_json::Value, OperationError> {
    let params: MoveFileParams = parse(params)?;
    let from = resolve(root, &params.from)?;
    let to = resolve(root, &params.to)?;
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(&to))?;
    }
    std::fs::rename(&from, &to).map_err(io_err(&from))?;
    Ok(serde_json::json!({ "from": params.from, "to": params.to }))
}

#[derive(Debug, Deserialize)]
struct MkDirParams {
    path: String,
}

fn mk_dir(root: &Path, params: &serde_json::Value) -> Result<serde_json::Value, OperationError> {
    let params: MkDirParams = parse(params)?;
    let target = resolve(root, &params.path)?;
    std::fs::create_dir_all(&target).map_err(io_err(&target))?;
    Ok(serde_json::json!({ "path": params.path }))
}
