//! Container registries and their image lifecycle rule.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ValidationError, ValidationResult};

/// Number of most recently pushed images each registry keeps.
pub const KEEP_LAST_IMAGES: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDescriptor {
    pub name: String,
    pub scan_on_push: bool,
    pub lifecycle: LifecycleRule,
}

impl RegistryDescriptor {
    pub fn new(name: &str) -> ValidationResult<Self> {
        if !valid_registry_name(name) {
            return Err(ValidationError::InvalidName {
                field: "registry",
                value: name.to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            scan_on_push: true,
            lifecycle: LifecycleRule::default(),
        })
    }
}

/// Expire everything except the `keep_last` most recently pushed images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRule {
    pub keep_last: u32,
}

impl Default for LifecycleRule {
    fn default() -> Self {
        Self {
            keep_last: KEEP_LAST_IMAGES,
        }
    }
}

/// An image as reported by a registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub digest: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Unix timestamp (seconds) of the push.
    pub pushed_at: u64,
}

/// Outcome of applying a lifecycle rule to a registry's images.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleVerdict {
    /// Newest first.
    pub retained: Vec<ImageRecord>,
    /// Newest first.
    pub expired: Vec<ImageRecord>,
}

impl LifecycleRule {
    /// Split `images` into the retained newest `keep_last` and the rest.
    ///
    /// Images pushed in the same second are ordered by digest so the split
    /// is deterministic.
    pub fn evaluate(&self, images: &[ImageRecord]) -> LifecycleVerdict {
        let mut sorted = images.to_vec();
        sorted.sort_by(|a, b| {
            b.pushed_at
                .cmp(&a.pushed_at)
                .then_with(|| a.digest.cmp(&b.digest))
        });
        let keep = (self.keep_last as usize).min(sorted.len());
        let expired = sorted.split_off(keep);
        LifecycleVerdict {
            retained: sorted,
            expired,
        }
    }

    /// Render the rule as a registry lifecycle policy document.
    pub fn policy_document(&self) -> serde_json::Value {
        json!({
            "rules": [{
                "rulePriority": 1,
                "description": format!("Keep last {} images", self.keep_last),
                "selection": {
                    "tagStatus": "any",
                    "countType": "imageCountMoreThan",
                    "countNumber": self.keep_last,
                },
                "action": { "type": "expire" },
            }]
        })
    }
}

fn valid_registry_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit())
        && name.len() <= 256
        && chars.all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-' | '/')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images(count: u64) -> Vec<ImageRecord> {
        (0..count)
            .map(|i| ImageRecord {
                digest: format!("sha256:{i:04}"),
                tags: vec![format!("v{i}")],
                pushed_at: 1_700_000_000 + i * 60,
            })
            .collect()
    }

    #[test]
    fn keeps_exactly_ten_newest() {
        let verdict = LifecycleRule::default().evaluate(&images(25));
        assert_eq!(verdict.retained.len(), 10);
        assert_eq!(verdict.expired.len(), 15);
        assert_eq!(verdict.retained[0].digest, "sha256:0024");
        assert_eq!(verdict.retained[9].digest, "sha256:0015");
        assert!(
            verdict
                .expired
                .iter()
                .all(|old| verdict.retained.iter().all(|kept| kept.pushed_at > old.pushed_at))
        );
    }

    #[test]
    fn fewer_than_ten_expires_nothing() {
        let verdict = LifecycleRule::default().evaluate(&images(4));
        assert_eq!(verdict.retained.len(), 4);
        assert!(verdict.expired.is_empty());
    }

    #[test]
    fn unordered_input_is_sorted_by_push_time() {
        let mut input = images(12);
        input.reverse();
        input.swap(0, 7);
        let verdict = LifecycleRule::default().evaluate(&input);
        let expired: Vec<_> = verdict.expired.iter().map(|i| i.digest.as_str()).collect();
        assert_eq!(expired, ["sha256:0001", "sha256:0000"]);
    }

    #[test]
    fn policy_document_counts_ten() {
        let doc = LifecycleRule::default().policy_document();
        assert_eq!(doc["rules"][0]["selection"]["countNumber"], 10);
        assert_eq!(doc["rules"][0]["action"]["type"], "expire");
    }

    #[test]
    fn registry_names_are_checked() {
        assert!(RegistryDescriptor::new("sponge/api-server").is_ok());
        assert!(RegistryDescriptor::new("Sponge").is_err());
        assert!(RegistryDescriptor::new("-api").is_err());
        assert!(RegistryDescriptor::new("").is_err());
    }
}
