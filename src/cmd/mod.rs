//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module     | Command handled                               |
//! |------------|-----------------------------------------------|
//! | `plan`     | `Plan` — validate without executing           |
//! | `run`      | `Run` — full execution lifecycle              |
//! | `rollback` | `Rollback` — restore to a recorded point      |
//! | `status`   | `Status` — inspect tape and result            |

pub mod plan;
pub mod rollback;
pub mod run;
pub mod status;

pub use plan::cmd_plan;
pub use rollback::cmd_rollback;
pub use run::cmd_run;
pub use status::cmd_status;

use std::path::{Path, PathBuf};
use warden::config::WardenPaths;

/// Resolve the state layout for a repository, honoring `--state-dir`.
pub fn resolve_paths(repo: &Path, state_dir: Option<PathBuf>) -> WardenPaths {
    match state_dir {
        Some(dir) => WardenPaths::at(dir),
        None => WardenPaths::for_repo(repo),
    }
}
