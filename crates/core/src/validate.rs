use crate::error::{InboxError, Violation};

/// Accumulates input violations across a DTO and folds them into one
/// ValidationError, so a response reports every bad field at once.
#[derive(Debug, Default)]
pub struct Validator {
    violations: Vec<Violation>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&mut self, field: &str, message: &str) {
        self.violations.push(Violation {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn require(&mut self, field: &str, ok: bool, message: &str) {
        if !ok {
            self.fail(field, message);
        }
    }

    pub fn require_max_len(&mut self, field: &str, value: &str, max: usize) {
        if value.chars().count() > max {
            self.fail(field, &format!("must be at most {} characters", max));
        }
    }

    pub fn require_one_of(&mut self, field: &str, value: &str, allowed: &[&str]) {
        if !allowed.contains(&value) {
            self.fail(field, &format!("must be one of {}", allowed.join(", ")));
        }
    }

    pub fn finish(self) -> Result<(), InboxError> {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(InboxError::Validation(self.violations))
        }
    }
}
