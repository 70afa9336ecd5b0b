use std::path::{Path, PathBuf};

use stacked_errors::{Result, StackableErr};
use tracing::info;

use crate::{acquire_dir_path, acquire_file_path};

pub const DOCKERFILE_NAME: &str = "Dockerfile";

/// Writes `contents` verbatim as UTF-8 to "Dockerfile" in `dir`, replacing
/// any existing one, and returns the path
pub async fn write_dockerfile(dir: impl AsRef<Path>, contents: &str) -> Result<PathBuf> {
    let dir = acquire_dir_path(dir)
        .await
        .stack_err("write_dockerfile -> could not acquire directory")?;
    let path = dir.join(DOCKERFILE_NAME);
    tokio::fs::write(&path, contents)
        .await
        .stack_err_with(|| format!("write_dockerfile -> writing {path:?}"))?;
    info!("wrote {path:?}");
    Ok(path)
}

/// Returns the path of the "Dockerfile" in the build context `dir`, failing
/// if there is none
pub async fn find_dockerfile(dir: impl AsRef<Path>) -> Result<PathBuf> {
    let dir = dir.as_ref();
    acquire_file_path(dir.join(DOCKERFILE_NAME))
        .await
        .stack_err_with(|| format!("find_dockerfile -> no {DOCKERFILE_NAME} in {dir:?}"))
}

/// The starting point Dockerfile for a Python application serving on port
/// 5000. Callers are expected to edit it before writing.
pub fn python_dockerfile(registry: &str, python_version: &str) -> String {
    let registry = registry.trim_end_matches('/');
    let base = if registry.is_empty() {
        format!("python:{python_version}")
    } else {
        format!("{registry}/python:{python_version}")
    };
    format!(
        r#"FROM {base}

WORKDIR /app

ENV PYTHONUNBUFFERED=1
ENV PYTHONDONTWRITEBYTECODE=1

COPY requirements.txt .
RUN pip install --no-cache-dir -r requirements.txt

COPY . .

EXPOSE 5000

CMD ["python", "app.py"]
"#
    )
}
