use std::error::Error;
use std::fmt::{Display, Formatter};

pub type SimResult<T> = Result<T, SimError>;
pub type ConfigResult<T> = SimResult<T>;
pub type StageResult<T> = SimResult<T>;

/// Failure class of a run; decides the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimErrorCategory {
    /// Bad configuration, input file or stage order. Raised before any
    /// output is written.
    InputValidationError,
    IoSystemError,
    ComputationError,
    /// A configured capacity was exceeded under a policy that aborts.
    CapacityOverflow,
    InternalError,
}

impl SimErrorCategory {
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::InputValidationError => 2,
            Self::IoSystemError => 3,
            Self::ComputationError | Self::CapacityOverflow => 4,
            Self::InternalError => 5,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::InputValidationError => "InputValidationError",
            Self::IoSystemError => "IoSystemError",
            Self::ComputationError => "ComputationError",
            Self::CapacityOverflow => "CapacityOverflow",
            Self::InternalError => "InternalError",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimError {
    category: SimErrorCategory,
    placeholder: &'static str,
    message: String,
}

impl SimError {
    pub fn new(
        category: SimErrorCategory,
        placeholder: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            placeholder,
            message: message.into(),
        }
    }

    pub fn input_validation(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(SimErrorCategory::InputValidationError, placeholder, message)
    }

    pub fn io_system(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(SimErrorCategory::IoSystemError, placeholder, message)
    }

    pub fn computation(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(SimErrorCategory::ComputationError, placeholder, message)
    }

    pub fn capacity_overflow(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(SimErrorCategory::CapacityOverflow, placeholder, message)
    }

    pub fn internal(placeholder: &'static str, message: impl Into<String>) -> Self {
        Self::new(SimErrorCategory::InternalError, placeholder, message)
    }

    pub const fn category(&self) -> SimErrorCategory {
        self.category
    }

    pub const fn placeholder(&self) -> &'static str {
        self.placeholder
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn exit_code(&self) -> i32 {
        self.category.exit_code()
    }

    /// `ERROR: [PLACEHOLDER] message`, the first line printed on failure.
    pub fn diagnostic_line(&self) -> String {
        format!("ERROR: [{}] {}", self.placeholder, self.message)
    }

    pub fn fatal_exit_line(&self) -> String {
        format!("FATAL EXIT CODE: {}", self.exit_code())
    }
}

impl Display for SimError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.category.name(),
            self.placeholder,
            self.message
        )
    }
}

impl Error for SimError {}

#[cfg(test)]
mod tests {
    use super::{SimError, SimErrorCategory};

    #[test]
    fn categories_map_to_exit_codes() {
        let cases = [
            (SimErrorCategory::InputValidationError, 2),
            (SimErrorCategory::IoSystemError, 3),
            (SimErrorCategory::ComputationError, 4),
            (SimErrorCategory::CapacityOverflow, 4),
            (SimErrorCategory::InternalError, 5),
        ];
        for (category, exit_code) in cases {
            assert_eq!(category.exit_code(), exit_code, "{}", category.name());
        }
        let error = SimError::capacity_overflow("CAPACITY.PIXELS", "too many pixels");
        assert_eq!(error.to_string(), "CapacityOverflow [CAPACITY.PIXELS] too many pixels");
    }

    #[test]
    fn fatal_error_renders_diagnostic_lines() {
        let error = SimError::input_validation(
            "INPUT.PARAM_LIST",
            "unknown fit parameter 'vdirft' in 'params.json'",
        );

        assert_eq!(error.exit_code(), 2);
        assert_eq!(
            error.diagnostic_line(),
            "ERROR: [INPUT.PARAM_LIST] unknown fit parameter 'vdirft' in 'params.json'"
        );
        assert_eq!(error.fatal_exit_line(), "FATAL EXIT CODE: 2");
    }
}
