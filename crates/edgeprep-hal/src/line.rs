//! Generic `OutputLine` trait for actuator resources (buzzers, LEDs,
//! solenoids, …) that have a single writable value.

use crate::HalError;

/// A writable actuator resource.
///
/// Drivers implement this trait and register themselves with an
/// [`ActuatorRegistry`][crate::registry::ActuatorRegistry]. Methods take
/// `&self` so a line can be shared with the quiesce worker thread.
pub trait OutputLine: Send + Sync {
    /// Stable identifier for this line, e.g. `"gpio12"`.
    fn id(&self) -> &str;

    /// Whether the underlying resource currently exists. A line whose
    /// resource has been released (pin unexported, device unplugged) reports
    /// `false`.
    fn is_present(&self) -> bool;

    /// Drive the line to `value`.
    ///
    /// # Errors
    ///
    /// Returns [`HalError`] if the value cannot be applied.
    fn write_value(&self, value: &str) -> Result<(), HalError>;

    /// Read back the current value.
    fn read_value(&self) -> Result<String, HalError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockLine {
        id: String,
        value: Mutex<String>,
    }

    impl OutputLine for MockLine {
        fn id(&self) -> &str {
            &self.id
        }

        fn is_present(&self) -> bool {
            true
        }

        fn write_value(&self, value: &str) -> Result<(), HalError> {
            *self.value.lock().unwrap() = value.to_string();
            Ok(())
        }

        fn read_value(&self) -> Result<String, HalError> {
            Ok(self.value.lock().unwrap().clone())
        }
    }

    #[test]
    fn mock_line_write_and_read() {
        let line = MockLine {
            id: "buzzer".to_string(),
            value: Mutex::new("1".to_string()),
        };
        assert_eq!(line.id(), "buzzer");
        line.write_value("0").unwrap();
        assert_eq!(line.read_value().unwrap(), "0");
    }
}
