//! Small filesystem helpers shared by the task workers.

use std::path::Path;

use tracing::warn;

/// Chmod that logs instead of failing; engine containers run as a different
/// uid and need world-writable output directories.
pub fn chmod_best_effort(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(error) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
            warn!(path = %path.display(), mode = format!("{mode:o}"), error = %error, "chmod failed");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
}

/// Read a file to a string, returning empty on any error.
pub fn read_file_safe(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

/// Flatten an env map into docker `KEY=value` form.
pub fn env_map_to_vec(env: &std::collections::HashMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_file_safe_missing() {
        assert_eq!(read_file_safe(Path::new("/nonexistent/file")), "");
    }

    #[test]
    fn test_env_map_to_vec() {
        let mut env = std::collections::HashMap::new();
        env.insert("A".to_string(), "1".to_string());
        let flat = env_map_to_vec(&env);
        assert_eq!(flat, vec!["A=1".to_string()]);
    }
}
