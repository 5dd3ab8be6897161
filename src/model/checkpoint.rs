//! Checkpoint discovery.
//!
//! Checkpoint files live in a model's `checkpoints/` directory and are named
//! `checkpoint_best.<ext>` or `checkpoint_ep<epoch>.<ext>`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which checkpoint of a model to test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SelectorRepr", into = "SelectorRepr")]
pub enum CheckpointSelector {
    /// The checkpoint marked best during training
    Best,
    /// The highest epoch available
    Latest,
    /// A specific epoch
    Epoch(u32),
}

/// Accepts `best`, `latest`, `"12"` or `12` in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum SelectorRepr {
    Epoch(u32),
    Text(String),
}

impl TryFrom<SelectorRepr> for CheckpointSelector {
    type Error = String;

    fn try_from(value: SelectorRepr) -> Result<Self, Self::Error> {
        match value {
            SelectorRepr::Epoch(n) => Ok(CheckpointSelector::Epoch(n)),
            SelectorRepr::Text(s) => s.parse(),
        }
    }
}

impl From<CheckpointSelector> for SelectorRepr {
    fn from(value: CheckpointSelector) -> Self {
        match value {
            CheckpointSelector::Epoch(n) => SelectorRepr::Epoch(n),
            other => SelectorRepr::Text(other.to_string()),
        }
    }
}

impl std::str::FromStr for CheckpointSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "best" => Ok(CheckpointSelector::Best),
            "latest" | "last" => Ok(CheckpointSelector::Latest),
            other => other
                .trim_start_matches("ep")
                .parse::<u32>()
                .map(CheckpointSelector::Epoch)
                .map_err(|_| format!("Invalid checkpoint selector '{}': expected best, latest or an epoch", s)),
        }
    }
}

impl std::fmt::Display for CheckpointSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointSelector::Best => f.write_str("best"),
            CheckpointSelector::Latest => f.write_str("latest"),
            CheckpointSelector::Epoch(n) => write!(f, "{}", n),
        }
    }
}

const BEST_STEM: &str = "checkpoint_best";
const EPOCH_PREFIX: &str = "checkpoint_ep";

/// Epoch encoded in a checkpoint file name, if any.
fn epoch_of(path: &Path) -> Option<u32> {
    path.file_stem()?
        .to_str()?
        .strip_prefix(EPOCH_PREFIX)?
        .parse()
        .ok()
}

/// Locate the checkpoint file in `dir` matching `selector`.
pub fn find_checkpoint_file(dir: &Path, selector: &CheckpointSelector) -> Result<PathBuf> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Cannot read checkpoint directory {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    // Deterministic choice when several extensions share a stem
    files.sort();

    let found = match selector {
        CheckpointSelector::Best => files
            .into_iter()
            .find(|p| p.file_stem().and_then(|s| s.to_str()) == Some(BEST_STEM)),
        CheckpointSelector::Latest => files
            .into_iter()
            .filter_map(|p| epoch_of(&p).map(|e| (e, p)))
            .max_by_key(|(e, _)| *e)
            .map(|(_, p)| p),
        CheckpointSelector::Epoch(n) => files.into_iter().find(|p| epoch_of(p) == Some(*n)),
    };

    found.ok_or_else(|| {
        anyhow::anyhow!(
            "No '{}' checkpoint found in {}",
            selector,
            dir.display()
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn checkpoint_dir(names: &[&str]) -> TempDir {
        let tmp = TempDir::new().unwrap();
        for name in names {
            std::fs::write(tmp.path().join(name), b"weights").unwrap();
        }
        tmp
    }

    #[test]
    fn test_selector_parse() {
        assert_eq!("best".parse::<CheckpointSelector>().unwrap(), CheckpointSelector::Best);
        assert_eq!("Latest".parse::<CheckpointSelector>().unwrap(), CheckpointSelector::Latest);
        assert_eq!("42".parse::<CheckpointSelector>().unwrap(), CheckpointSelector::Epoch(42));
        assert_eq!("ep007".parse::<CheckpointSelector>().unwrap(), CheckpointSelector::Epoch(7));
        assert!("soonest".parse::<CheckpointSelector>().is_err());
    }

    #[test]
    fn test_selector_serde() {
        let s: CheckpointSelector = serde_yaml::from_str("best").unwrap();
        assert_eq!(s, CheckpointSelector::Best);
        let s: CheckpointSelector = serde_yaml::from_str("15").unwrap();
        assert_eq!(s, CheckpointSelector::Epoch(15));
        let s: CheckpointSelector = serde_json::from_str("\"latest\"").unwrap();
        assert_eq!(s, CheckpointSelector::Latest);
        assert_eq!(serde_json::to_string(&CheckpointSelector::Epoch(3)).unwrap(), "3");
    }

    #[test]
    fn test_find_best() {
        let dir = checkpoint_dir(&["checkpoint_ep001.pth", "checkpoint_best.pth", "checkpoint_ep010.pth"]);
        let path = find_checkpoint_file(dir.path(), &CheckpointSelector::Best).unwrap();
        assert!(path.ends_with("checkpoint_best.pth"));
    }

    #[test]
    fn test_find_latest_uses_numeric_order() {
        let dir = checkpoint_dir(&["checkpoint_ep9.pth", "checkpoint_ep10.pth", "checkpoint_ep002.pth"]);
        let path = find_checkpoint_file(dir.path(), &CheckpointSelector::Latest).unwrap();
        assert!(path.ends_with("checkpoint_ep10.pth"));
    }

    #[test]
    fn test_find_epoch() {
        let dir = checkpoint_dir(&["checkpoint_ep001.pth", "checkpoint_ep002.pth"]);
        let path = find_checkpoint_file(dir.path(), &CheckpointSelector::Epoch(2)).unwrap();
        assert!(path.ends_with("checkpoint_ep002.pth"));

        assert!(find_checkpoint_file(dir.path(), &CheckpointSelector::Epoch(3)).is_err());
        assert!(find_checkpoint_file(dir.path(), &CheckpointSelector::Best).is_err());
    }

    #[test]
    fn test_missing_dir() {
        let tmp = TempDir::new().unwrap();
        let result = find_checkpoint_file(&tmp.path().join("nope"), &CheckpointSelector::Latest);
        assert!(result.is_err());
    }
}
