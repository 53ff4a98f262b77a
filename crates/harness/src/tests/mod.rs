//! Fixtures shared by the unit tests of several modules.

pub(crate) mod fake_http;
