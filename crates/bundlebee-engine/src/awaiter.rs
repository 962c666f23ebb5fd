//! Polls the cluster until a descriptor reaches its await conditions.
//!
//! Per descriptor and command:
//!
//! - a descriptor flagged `await` first waits for its resources to exist (to be gone for the
//!   `delete` command),
//! - then every [`AwaitConditions`] group applying to the command is awaited concurrently, a group
//!   being satisfied when all (`ALL`) or one (`ANY`) of its conditions are.
//!
//! A single deadline, computed when the wait starts, bounds the whole wait. Dropping the returned
//! future stops the polling.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::FutureExt;
use snafu::Snafu;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, instrument, trace};

use crate::{
    condition::json::{self, EvaluationError},
    config::AwaiterOptions,
    futures::{Aggregate, first_ok, join_all},
    kube::ResourceClient,
    manifest::{AwaitCondition, AwaitConditions, ConditionOperator, JsonPointerOperator},
    patch::LoadedDescriptor,
    resolver::{DescriptorAwaiter, list_errors},
    substitutor::BoxedError,
};

pub const APPLY_COMMAND: &str = "apply";
pub const DELETE_COMMAND: &str = "delete";

const HTTP_OK: u16 = 200;

/// Shortest delay between two polls, a zero interval is raised to it.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("timeout awaiting {descriptor}, condition: {condition}"))]
    Timeout {
        descriptor: String,
        condition: String,
    },

    #[snafu(display("{} await failures:{}", errors.len(), list_errors(errors)))]
    Multiple { errors: Vec<Error> },
}

impl Aggregate for Error {
    fn aggregate(errors: Vec<Self>) -> Self {
        Self::Multiple { errors }
    }
}

pub struct ConditionAwaiter {
    client: Arc<dyn ResourceClient>,
    options: AwaiterOptions,
}

impl ConditionAwaiter {
    pub fn new(client: Arc<dyn ResourceClient>, options: AwaiterOptions) -> Self {
        Self { client, options }
    }

    /// Waits for `loaded` to be ready for `command` (compared case-insensitively).
    #[instrument(skip_all, fields(descriptor = %loaded.name(), command = %command))]
    pub async fn await_descriptor(
        &self,
        command: &str,
        loaded: &LoadedDescriptor,
    ) -> Result<(), Error> {
        let descriptor = &loaded.descriptor;
        let groups = descriptor
            .await_conditions
            .iter()
            .filter(|group| group.applies_to(command))
            .collect::<Vec<_>>();
        if !descriptor.await_ && groups.is_empty() {
            return Ok(());
        }

        let deadline = Instant::now() + *self.options.timeout;
        if descriptor.await_ {
            let expected = !command.eq_ignore_ascii_case(DELETE_COMMAND);
            let condition = if expected {
                "resource exists"
            } else {
                "resource deleted"
            };
            self.poll(loaded, deadline, condition, || async move {
                if self.client.is_dry_run() {
                    return Ok(true);
                }
                let exists = self
                    .client
                    .exists(&loaded.content, &loaded.extension)
                    .await?;
                Ok::<_, BoxedError>(exists == expected)
            })
            .await?;
        }

        join_all(
            groups
                .into_iter()
                .map(|group| self.await_group(group, loaded, deadline).boxed())
                .collect::<Vec<_>>(),
        )
        .await?;
        debug!("descriptor ready");
        Ok(())
    }

    async fn await_group(
        &self,
        group: &AwaitConditions,
        loaded: &LoadedDescriptor,
        deadline: Instant,
    ) -> Result<(), Error> {
        let conditions = group
            .conditions
            .iter()
            .map(|condition| self.await_condition(condition, loaded, deadline).boxed())
            .collect::<Vec<_>>();
        match group.operator {
            ConditionOperator::All => join_all(conditions).await.map(|_| ()),
            ConditionOperator::Any => first_ok(conditions).await,
        }
    }

    async fn await_condition(
        &self,
        condition: &AwaitCondition,
        loaded: &LoadedDescriptor,
        deadline: Instant,
    ) -> Result<(), Error> {
        self.poll(loaded, deadline, &condition.to_string(), || async {
            let responses = self
                .client
                .get_resources(&loaded.content, &loaded.extension)
                .await?;
            if responses.iter().any(|response| response.dry_run) {
                return Ok(true);
            }
            Ok::<_, BoxedError>(
                responses.iter().all(|response| response.status == HTTP_OK)
                    && responses
                        .iter()
                        .any(|response| is_satisfied(condition, &response.body)),
            )
        })
        .await
    }

    /// Runs `check` every interval until it returns `true` or the deadline passes.
    ///
    /// Failing checks are logged and retried.
    async fn poll<F, Fut>(
        &self,
        loaded: &LoadedDescriptor,
        deadline: Instant,
        condition: &str,
        check: F,
    ) -> Result<(), Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<bool, BoxedError>>,
    {
        let period = (*self.options.interval).max(MIN_POLL_INTERVAL);
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match check().await {
                Ok(true) => {
                    trace!(condition, "condition reached");
                    return Ok(());
                }
                Ok(false) => trace!(condition, "condition not reached yet"),
                Err(error) => debug!(condition, %error, "failed to evaluate condition"),
            }
            if Instant::now() >= deadline {
                return TimeoutSnafu {
                    descriptor: loaded.name(),
                    condition,
                }
                .fail();
            }
        }
    }
}

/// An unresolvable pointer only satisfies [`JsonPointerOperator::Missing`].
fn is_satisfied(condition: &AwaitCondition, body: &serde_json::Value) -> bool {
    match json::evaluate(condition, body) {
        Ok(satisfied) => satisfied,
        Err(EvaluationError::PointerNotFound { .. })
            if matches!(
                condition,
                AwaitCondition::JsonPointer {
                    operator_type: JsonPointerOperator::Missing,
                    ..
                }
            ) =>
        {
            true
        }
        Err(error) => {
            trace!(%error, %condition, "condition not evaluable yet");
            false
        }
    }
}

/// A [`ConditionAwaiter`] bound to a command, usable by the resolver.
pub struct CommandAwaiter {
    awaiter: Arc<ConditionAwaiter>,
    command: String,
}

impl CommandAwaiter {
    pub fn new(awaiter: Arc<ConditionAwaiter>, command: impl Into<String>) -> Self {
        Self {
            awaiter,
            command: command.into(),
        }
    }
}

#[async_trait]
impl DescriptorAwaiter for CommandAwaiter {
    async fn await_descriptor(&self, descriptor: &LoadedDescriptor) -> Result<(), BoxedError> {
        Ok(self
            .awaiter
            .await_descriptor(&self.command, descriptor)
            .await?)
    }
}
