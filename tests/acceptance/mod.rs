//! Integration tests for TSN pub/sub acceptance testing.

mod common;
mod measurement_test;
mod registry_test;
mod timing_test;
