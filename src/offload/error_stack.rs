use serde::{Deserialize, Serialize};

/// One diagnostic entry relayed back to the parent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    #[serde(rename = "Subsystem")]
    pub subsystem: String,
    #[serde(rename = "Code")]
    pub code: i32,
    #[serde(rename = "Message")]
    pub message: String,
}

/// Ordered diagnostics accumulated while one request is processed.
///
/// The stack has a single owner at any time: it is moved into a session when
/// the handshake does not finish in its first step, and consumed by
/// [`ErrorStack::into_entries`] when the result record is built.
#[derive(Debug)]
pub struct ErrorStack {
    subsystem: String,
    entries: Vec<ErrorEntry>,
}

impl ErrorStack {
    #[must_use]
    pub fn new(subsystem: impl Into<String>) -> Self {
        Self {
            subsystem: subsystem.into(),
            entries: Vec::new(),
        }
    }

    /// Start from the entries the parent asked to have echoed back.
    #[must_use]
    pub fn seeded(subsystem: impl Into<String>, entries: Vec<ErrorEntry>) -> Self {
        Self {
            subsystem: subsystem.into(),
            entries,
        }
    }

    /// Append an entry attributed to this worker's subsystem.
    pub fn push(&mut self, code: i32, message: impl Into<String>) {
        self.entries.push(ErrorEntry {
            subsystem: self.subsystem.clone(),
            code,
            message: message.into(),
        });
    }

    #[must_use]
    pub fn subsystem(&self) -> &str {
        &self.subsystem
    }

    #[must_use]
    pub fn entries(&self) -> &[ErrorEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release the stack, handing its entries to the result record.
    #[must_use]
    pub fn into_entries(self) -> Vec<ErrorEntry> {
        self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_uses_own_subsystem() {
        let mut stack = ErrorStack::new("SCHEDD");
        stack.push(7, "first");
        stack.push(8, "second");

        assert_eq!(stack.len(), 2);
        assert_eq!(stack.entries()[0].subsystem, "SCHEDD");
        assert_eq!(stack.entries()[1].code, 8);
    }

    #[test]
    fn seeded_entries_keep_order() {
        let seed = vec![ErrorEntry {
            subsystem: "COLLECTOR".to_string(),
            code: 3,
            message: "context from parent".to_string(),
        }];
        let mut stack = ErrorStack::seeded("SCHEDD", seed);
        stack.push(4, "handshake failed");

        let entries = stack.into_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].subsystem, "COLLECTOR");
        assert_eq!(entries[1].subsystem, "SCHEDD");
    }

    #[test]
    fn entry_uses_record_attribute_names() -> Result<(), serde_json::Error> {
        let entry = ErrorEntry {
            subsystem: "SCHEDD".to_string(),
            code: 1,
            message: "boom".to_string(),
        };
        let json = serde_json::to_value(&entry)?;
        assert_eq!(json["Subsystem"], "SCHEDD");
        assert_eq!(json["Code"], 1);
        assert_eq!(json["Message"], "boom");
        Ok(())
    }
}
