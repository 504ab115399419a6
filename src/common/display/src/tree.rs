//! Tree display for operator plans.

use std::fmt;

/// One operator in an explain tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplainNode {
    name: String,
    details: Vec<(String, String)>,
    children: Vec<ExplainNode>,
}

impl ExplainNode {
    /// Create a leaf node.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            details: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Attach a `key=value` detail.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.details.push((key.into(), value.to_string()));
        self
    }

    /// Attach a child operator.
    #[must_use]
    pub fn with_child(mut self, child: Self) -> Self {
        self.children.push(child);
        self
    }

    /// Operator name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Child operators.
    pub fn children(&self) -> &[Self] {
        &self.children
    }

    /// Value of a detail, if present.
    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn write_label(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.details.is_empty() {
            let details: Vec<_> = self
                .details
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, " ({})", details.join(", "))?;
        }
        writeln!(f)
    }

    fn write_children(&self, f: &mut fmt::Formatter<'_>, prefix: &str) -> fmt::Result {
        let count = self.children.len();
        for (i, child) in self.children.iter().enumerate() {
            let is_last = i + 1 == count;
            let connector = if is_last { "└─ " } else { "├─ " };
            write!(f, "{prefix}{connector}")?;
            child.write_label(f)?;
            let child_prefix = format!("{prefix}{}", if is_last { "   " } else { "│  " });
            child.write_children(f, &child_prefix)?;
        }
        Ok(())
    }
}

impl fmt::Display for ExplainNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_label(f)?;
        self.write_children(f, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_tree() {
        let tree = ExplainNode::new("Join")
            .with_detail("ordinal", "Shuffled")
            .with_child(ExplainNode::new("Where").with_child(ExplainNode::new("ArraySource")))
            .with_child(ExplainNode::new("ArraySource").with_detail("len", 3));

        let output = tree.to_string();
        assert_eq!(
            output,
            "Join (ordinal=Shuffled)\n├─ Where\n│  └─ ArraySource\n└─ ArraySource (len=3)\n"
        );
        assert_eq!(tree.children().len(), 2);
        assert_eq!(tree.children()[1].detail("len"), Some("3"));
    }
}
