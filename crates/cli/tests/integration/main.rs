//! End-to-end runs of cirrus-hello against a prebuilt dispatcher binary.

mod common;

mod build_tests;
mod provision_tests;
