use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use mend_core::file_kind;
use walkdir::{DirEntry, WalkDir};

const SKIPPED_DIRS: &[&str] = &[
    "node_modules",
    "__pycache__",
    "venv",
    "build",
    "dist",
    "site-packages",
];

/// Expands `inputs` into the workspace files mend knows how to handle.
/// Relative inputs are taken from `workspace_root`; directories are walked,
/// skipping hidden and vendored directories. The result is sorted and free
/// of duplicates.
pub fn collect_paths(workspace_root: &Path, inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut collected = Vec::new();
    for input in inputs {
        // collecting components drops interior `.` segments
        let path: PathBuf = workspace_root.join(input).components().collect();

        if path.is_file() {
            collected.push(path);
            continue;
        }
        if !path.is_dir() {
            bail!("path not found: {}", input.display());
        }

        for entry in WalkDir::new(&path)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_skipped_dir(entry))
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::debug!(error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if entry.file_type().is_file() && file_kind(entry.path()).is_some() {
                collected.push(entry.into_path());
            }
        }
    }

    collected.sort();
    collected.dedup();
    Ok(collected)
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_ref())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn directories_expand_to_supported_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();
        for file in [
            "app/main.py",
            "app/util.py",
            "app/logo.png",
            "web/index.ts",
            "node_modules/pkg/index.js",
            ".venv/lib/site.py",
            ".mend/config.toml",
            "app/__pycache__/main.cpython-312.pyc",
            "README.md",
        ] {
            let path = root.join(file);
            fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            fs::write(path, "x\n").expect("write");
        }

        let found = collect_paths(root, &[PathBuf::from(".")]).expect("collect");
        let relative: Vec<String> = found
            .iter()
            .map(|path| {
                path.strip_prefix(root)
                    .unwrap_or(path)
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();

        assert_eq!(
            relative,
            vec!["README.md", "app/main.py", "app/util.py", "web/index.ts"]
        );
    }

    #[test]
    fn explicit_files_are_kept_and_missing_paths_fail() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.py"), "x = 1\n").expect("write");

        let found = collect_paths(dir.path(), &[PathBuf::from("a.py"), PathBuf::from("a.py")])
            .expect("collect");
        assert_eq!(found, vec![dir.path().join("a.py")]);

        assert!(collect_paths(dir.path(), &[PathBuf::from("missing")]).is_err());
    }
}
