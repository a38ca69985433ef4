//! Error plumbing shared by the allocator crates.
//!
//! Every error variant in the workspace records the source location where it
//! was built through [`Location`], which implements
//! [`GenerateImplicitData`] so that `#[snafu(implicit)]` fills it in.
//! [`Report`] renders an error together with that location and its chain of
//! causes, one per line, for log output.

#![cfg_attr(not(test), no_std)]

use core::{error::Error, fmt};

use snafu::GenerateImplicitData;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Errors that know where they were raised.
pub trait Located {
    fn location(&self) -> Location;
}

pub struct Report<'a, E> {
    error: &'a E,
}

impl<'a, E> Report<'a, E> {
    pub fn new(error: &'a E) -> Self {
        Self { error }
    }
}

impl<E> fmt::Debug for Report<'_, E>
where
    E: Error + Located,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<'_, E>
where
    E: Error + Located,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at {})", self.error, self.error.location())?;
        let mut source = self.error.source();
        let mut index = 0;
        while let Some(s) = source {
            write!(f, "\n{index:4}: {s}")?;
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}
