//! Agent identity resolution (§6): environment variable, else a local
//! identity file, else a freshly generated UUID persisted back to that file.

use std::path::Path;

const ENV_VAR: &str = "AUTOSCALER_AGENT_ID";
const ID_FILE: &str = "autoscaler-agent-id";

/// Resolves this process's stable agent id, in priority order:
/// 1. `AUTOSCALER_AGENT_ID` environment variable.
/// 2. The contents of `autoscaler-agent-id` in the working directory.
/// 3. A freshly generated UUID, written back to that file for next time.
pub fn resolve() -> anyhow::Result<String> {
    resolve_in(Path::new("."))
}

fn resolve_in(dir: &Path) -> anyhow::Result<String> {
    if let Ok(id) = std::env::var(ENV_VAR) {
        if !id.is_empty() {
            return Ok(id);
        }
    }

    let path = dir.join(ID_FILE);
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let generated = uuid::Uuid::new_v4().to_string();
    std::fs::write(&path, &generated)?;
    Ok(generated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_persists_an_id() {
        let dir = tempdir();
        let first = resolve_in(&dir).unwrap();
        let second = resolve_in(&dir).unwrap();
        assert_eq!(first, second);
        std::fs::remove_dir_all(&dir).ok();
    }

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("autoscaler-agent-id-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
