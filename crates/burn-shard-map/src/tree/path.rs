use core::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
enum PathEntry {
    Index(usize),
    Field(String),
}

/// Location of a node inside a [`Tree`](super::Tree), used in error messages.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TreePath(Vec<PathEntry>);

impl TreePath {
    /// The root of a tree.
    pub fn root() -> Self {
        Self::default()
    }

    /// This path extended by a tuple index.
    pub fn index(&self, idx: usize) -> Self {
        self.child(PathEntry::Index(idx))
    }

    /// This path extended by a record field.
    pub fn field(&self, name: &str) -> Self {
        self.child(PathEntry::Field(name.to_string()))
    }

    fn child(&self, entry: PathEntry) -> Self {
        let mut entries = self.0.clone();
        entries.push(entry);
        Self(entries)
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "<root>");
        }
        for entry in &self.0 {
            match entry {
                PathEntry::Index(idx) => write!(f, "[{idx}]")?,
                PathEntry::Field(name) => write!(f, ".{name}")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let path = TreePath::root().index(0).field("weight").index(2);

        assert_eq!(TreePath::root().to_string(), "<root>");
        assert_eq!(path.to_string(), "[0].weight[2]");
    }
}
