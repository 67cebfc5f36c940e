/// Logging macros
#[macro_use]
#[allow(missing_docs)]
pub mod macro_logger;
/// Error status for host-supplied capabilities
pub mod status;

/// Mocks of host capabilities for testing
#[cfg(any(test, feature = "test_utils"))]
#[allow(missing_docs)]
pub mod mocks;
/// Transaction, block and channel fixtures for testing
#[cfg(any(test, feature = "test_utils"))]
#[allow(missing_docs)]
pub mod test_utils;
