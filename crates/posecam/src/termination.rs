//! Defines the [`Termination`] trait.

use std::{convert::Infallible, fmt::Debug, process};

/// Extends [`std::process::Termination`] with a way to ask whether the application succeeded.
///
/// The GUI event loop owns the main thread and never returns, so [`crate::run`] exits the process
/// itself once the application function returns, using this to pick the exit code.
pub trait Termination: process::Termination {
    fn is_success(&self) -> bool;
}

impl Termination for Infallible {
    fn is_success(&self) -> bool {
        match *self {}
    }
}

impl Termination for () {
    fn is_success(&self) -> bool {
        true
    }
}

impl<T: Termination, E: Debug> Termination for Result<T, E> {
    fn is_success(&self) -> bool {
        match self {
            Ok(term) => term.is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results() {
        assert!(().is_success());
        assert!(Ok::<(), String>(()).is_success());
        assert!(!Err::<(), _>("camera gone").is_success());
        assert!(!Ok::<Result<(), &str>, &str>(Err("nested")).is_success());
    }
}
