//! BDD scenarios for the target lifecycle.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LifecycleContext, lifecycle_context};

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Create a target and reach its daemon"
)]
fn scenario_create_and_connect(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Reject incomplete target options before any remote call"
)]
fn scenario_reject_incomplete_options(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Give up when the machine never becomes ready"
)]
fn scenario_readiness_timeout(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Destroy an existing target"
)]
fn scenario_destroy_existing(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}
