//! BDD step definitions for the target lifecycle.

use fly_provider::ProviderError;
use fly_provider::machines::MachineState;
use fly_provider::test_support::FakeMachinesApi;
use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{
    APP, LifecycleContext, LifecycleOutcome, LifecycleTestError, Operation, existing_machine,
    run_operation,
};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] LifecycleTestError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a provider whose machine is ready after \"{polls}\" polls")]
fn machine_ready_after(mut lifecycle_context: LifecycleContext, polls: usize) -> LifecycleContext {
    lifecycle_context.machines = FakeMachinesApi::new().ready_after(polls);
    lifecycle_context
}

#[given("a provider whose machine never becomes ready")]
fn machine_never_ready(mut lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context.machines = FakeMachinesApi::new().never_ready();
    lifecycle_context
}

#[given("the agent answers on dial attempt \"{attempt}\"")]
fn agent_answers_on(mut lifecycle_context: LifecycleContext, attempt: usize) -> LifecycleContext {
    lifecycle_context.failing_dials = attempt.saturating_sub(1);
    lifecycle_context
}

#[given("target options without an org slug")]
fn options_without_org(mut lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context.request.options = String::from(r#"{"Auth Token":"tok"}"#);
    lifecycle_context
}

#[given("an existing target")]
fn existing_target(mut lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context.machines = FakeMachinesApi::new().with_machine(APP, existing_machine());
    lifecycle_context
}

fn perform(
    lifecycle_context: LifecycleContext,
    operation: Operation,
) -> Result<LifecycleContext, StepError> {
    let outcome = run_operation(&lifecycle_context, operation)?;
    Ok(LifecycleContext {
        outcome: Some(outcome),
        ..lifecycle_context
    })
}

#[when("I create the target")]
fn create_target(lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    perform(lifecycle_context, Operation::Create)
}

#[when("I destroy the target")]
fn destroy_target(lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    perform(lifecycle_context, Operation::Destroy)
}

#[when("I look up the target metadata")]
fn look_up_metadata(lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    perform(lifecycle_context, Operation::Metadata)
}

fn outcome(lifecycle_context: &LifecycleContext) -> Result<&LifecycleOutcome, StepError> {
    lifecycle_context
        .outcome
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("missing outcome")))
}

#[then("the target is running")]
fn target_running(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let result = outcome(lifecycle_context)?;
    if let Some(err) = &result.error {
        return Err(StepError::Assertion(format!("expected success, got {err}")));
    }
    if result.machine_state == Some(MachineState::Started) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected a started machine, got {:?}",
            result.machine_state
        )))
    }
}

#[then("the operation succeeds")]
fn operation_succeeds(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    match &outcome(lifecycle_context)?.error {
        None => Ok(()),
        Some(err) => Err(StepError::Assertion(format!("expected success, got {err}"))),
    }
}

#[then("the agent was dialled \"{count}\" times")]
fn agent_dialled(lifecycle_context: &LifecycleContext, count: usize) -> Result<(), StepError> {
    let dials = outcome(lifecycle_context)?.agent_dials;
    if dials == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} agent dials, got {dials}"
        )))
    }
}

#[then("the daemon connection echoes bytes")]
fn daemon_echoes(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let result = outcome(lifecycle_context)?;
    if result.echoed != b"ping" {
        return Err(StepError::Assertion(format!(
            "unexpected echo: {:?}",
            result.echoed
        )));
    }
    if result.forward_runs == 1 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected one forward, got {}",
            result.forward_runs
        )))
    }
}

#[then("the sink reports that the agent started")]
fn sink_reports_start(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let sink = &outcome(lifecycle_context)?.sink;
    if sink.contains("target agent started.\n") {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("sink output: {sink}")))
    }
}

#[then("the operation fails with a \"{kind}\" error")]
fn operation_fails(lifecycle_context: &LifecycleContext, kind: String) -> Result<(), StepError> {
    let Some(err) = &outcome(lifecycle_context)?.error else {
        return Err(StepError::Assertion(String::from(
            "expected failure outcome",
        )));
    };
    let matched = match kind.as_str() {
        "configuration" => matches!(err, ProviderError::Configuration(_)),
        "timeout" => matches!(err, ProviderError::Timeout { .. }),
        "not-found" => err.is_not_found(),
        "remote" => matches!(err, ProviderError::RemoteApi { .. }),
        other => {
            return Err(StepError::Assertion(format!("unknown error kind {other}")));
        }
    };
    if matched {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("expected {kind} error, got {err}")))
    }
}

#[then("no remote calls were made")]
fn no_remote_calls(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let calls = lifecycle_context.machines.calls();
    if calls.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("unexpected calls: {calls:?}")))
    }
}
