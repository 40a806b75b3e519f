use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Produces unique identifiers for scratch databases and tables.
pub trait NameGenerator: Send + Sync {
    /// A fresh name starting with `prefix`. Names contain only ASCII
    /// letters, digits and underscores, so they are valid SQL identifiers.
    fn generate(&self, prefix: &str) -> String;
}

/// Random names, safe to use against a shared server.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomNames;

impl NameGenerator for RandomNames {
    fn generate(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, Uuid::new_v4().simple())
    }
}

/// `prefix_1`, `prefix_2`, ... for reproducible runs.
#[derive(Debug, Default)]
pub struct SequentialNames {
    next: AtomicU64,
}

impl SequentialNames {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NameGenerator for SequentialNames {
    fn generate(&self, prefix: &str) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}_{}", prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_names_are_identifiers() {
        let a = RandomNames.generate("db");
        let b = RandomNames.generate("db");
        assert_ne!(a, b);
        assert!(a.starts_with("db_"));
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[test]
    fn test_sequential_names() {
        let names = SequentialNames::new();
        assert_eq!(names.generate("t"), "t_1");
        assert_eq!(names.generate("t"), "t_2");
    }
}
