use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Allocation failure: {0}")]
    AllocationFailure(String),
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("Registration failure: {0}")]
    RegistrationFailure(String),
    #[error("Interrupt unavailable: {0}")]
    InterruptUnavailable(String),
    #[error("Device busy: {0}")]
    Busy(String),
    #[error("Device not bound: {0}")]
    NotBound(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("GPIO error: {0}")]
    Gpio(String),
}

impl DriverError {
    /// Negative errno a kernel driver would hand back for the same failure.
    pub fn errno(&self) -> i32 {
        match self {
            DriverError::AllocationFailure(_) => -12,    // ENOMEM
            DriverError::ResourceUnavailable(_) => -19,  // ENODEV
            DriverError::RegistrationFailure(_) => -22,  // EINVAL
            DriverError::InterruptUnavailable(_) => -16, // EBUSY
            DriverError::Busy(_) => -16,
            DriverError::NotBound(_) => -19,
            DriverError::Config(_) => -22,
            DriverError::Gpio(_) => -5, // EIO
        }
    }
}
