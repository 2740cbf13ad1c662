//! Async git helpers used by change detection and freshness checks.
//!
//! Every call shells out to `git -C <root>`; paths in diff output are made
//! relative to the indexed root with `--relative`, so a root below the
//! repository top level works the same as the top level itself.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

use crate::error::{IndexError, Result};

/// One entry of `git diff --name-status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffEntry {
    Added(String),
    Modified(String),
    Deleted(String),
    Renamed { from: String, to: String },
}

/// Handle to the git repository containing an indexed root.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    /// Returns `None` when `root` is not inside a work tree or git is missing.
    pub async fn discover(root: &Path) -> Option<Self> {
        let output = Command::new("git")
            .args(["-C", &root.to_string_lossy(), "rev-parse", "--is-inside-work-tree"])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            debug!("{:?} is not inside a git work tree", root);
            return None;
        }
        if String::from_utf8_lossy(&output.stdout).trim() != "true" {
            return None;
        }
        Some(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Current HEAD commit, `None` for a repository without commits.
    pub async fn head(&self) -> Result<Option<String>> {
        let output = self.command(&["rev-parse", "--verify", "-q", "HEAD"]).await?;
        if !output.status.success() {
            return Ok(None);
        }
        let head = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if head.is_empty() { None } else { Some(head) })
    }

    /// Whether `commit` names a commit object in this repository.
    pub async fn commit_exists(&self, commit: &str) -> bool {
        let spec = format!("{}^{{commit}}", commit);
        match self.command(&["cat-file", "-e", &spec]).await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    pub async fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        let stdout = self.run(&["merge-base", a, b]).await?;
        let base = String::from_utf8_lossy(&stdout).trim().to_string();
        if base.is_empty() {
            return Err(IndexError::Git(format!("no merge base for {} and {}", a, b)));
        }
        Ok(base)
    }

    /// Run `git diff --name-status -M -z --relative` with the given revision
    /// arguments, e.g. `[rev]`, `[rev, "HEAD"]` or `["--cached", rev]`.
    pub async fn diff_name_status(&self, revs: &[&str]) -> Result<Vec<DiffEntry>> {
        let mut args = vec!["diff", "--name-status", "-M", "-z", "--relative", "--no-color"];
        args.extend_from_slice(revs);
        args.push("--");
        let stdout = self.run(&args).await?;
        parse_name_status(&stdout)
    }

    /// Untracked files that are not ignored, relative to the root.
    pub async fn untracked_files(&self) -> Result<Vec<String>> {
        let stdout = self
            .run(&["ls-files", "--others", "--exclude-standard", "-z"])
            .await?;
        Ok(split_nul(&stdout))
    }

    async fn command(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .output()
            .await
            .map_err(|e| IndexError::Git(format!("failed to run git {}: {}", args.join(" "), e)))
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = self.command(args).await?;
        if !output.status.success() {
            return Err(IndexError::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

fn split_nul(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

/// Parse NUL-separated `--name-status` output.
///
/// Status letters: A, M, D, T (type change), U (unmerged), R### and C###
/// (rename and copy with a similarity score, followed by two paths).
pub fn parse_name_status(bytes: &[u8]) -> Result<Vec<DiffEntry>> {
    let tokens = split_nul(bytes);
    let mut entries = Vec::new();
    let mut iter = tokens.into_iter();

    while let Some(status) = iter.next() {
        let mut next_path = || {
            iter.next()
                .ok_or_else(|| IndexError::Git(format!("truncated diff entry for status {}", status)))
        };
        let entry = match status.chars().next() {
            Some('A') => DiffEntry::Added(next_path()?),
            Some('M') | Some('T') | Some('U') => DiffEntry::Modified(next_path()?),
            Some('D') => DiffEntry::Deleted(next_path()?),
            Some('R') => {
                let from = next_path()?;
                let to = next_path()?;
                DiffEntry::Renamed { from, to }
            }
            Some('C') => {
                let _source = next_path()?;
                DiffEntry::Added(next_path()?)
            }
            _ => {
                return Err(IndexError::Git(format!(
                    "unexpected diff status {:?}",
                    status
                )))
            }
        };
        entries.push(entry);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_statuses() {
        let raw = b"M\0src/a.rs\0A\0src/b.rs\0D\0old.py\0";
        let entries = parse_name_status(raw).unwrap();
        assert_eq!(
            entries,
            vec![
                DiffEntry::Modified("src/a.rs".into()),
                DiffEntry::Added("src/b.rs".into()),
                DiffEntry::Deleted("old.py".into()),
            ]
        );
    }

    #[test]
    fn test_parse_rename_and_copy() {
        let raw = b"R100\0a.py\0b.py\0C075\0x.py\0y.py\0T\0link.rs\0";
        let entries = parse_name_status(raw).unwrap();
        assert_eq!(
            entries,
            vec![
                DiffEntry::Renamed {
                    from: "a.py".into(),
                    to: "b.py".into()
                },
                DiffEntry::Added("y.py".into()),
                DiffEntry::Modified("link.rs".into()),
            ]
        );
    }

    #[test]
    fn test_parse_paths_with_spaces_and_tabs() {
        let raw = b"M\0dir with space/a\tb.py\0";
        let entries = parse_name_status(raw).unwrap();
        assert_eq!(entries, vec![DiffEntry::Modified("dir with space/a\tb.py".into())]);
    }

    #[test]
    fn test_parse_empty_and_truncated() {
        assert!(parse_name_status(b"").unwrap().is_empty());
        assert!(parse_name_status(b"R090\0only_one.py\0").is_err());
        assert!(parse_name_status(b"X\0weird\0").is_err());
    }

    #[tokio::test]
    async fn test_discover_outside_repo() {
        let dir = tempfile::tempdir().unwrap();
        assert!(GitRepo::discover(dir.path()).await.is_none());
    }
}
