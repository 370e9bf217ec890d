//! Command descriptors, events, handler traits and the per-invocation context.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::AppResult;

/// Capability implied by [`CommandMetadata::admin_only`].
pub const ADMIN_CAPABILITY: &str = "admin";

/// An inbound request to run a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEvent {
    /// Name as typed by the user; matched case-insensitively.
    pub command_name: String,
    /// Identity of the invoking user.
    pub user_id: String,
    /// Where the command was invoked (server, channel, tenant), if anywhere.
    pub scope_id: Option<String>,
    /// Arguments following the command name.
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandEvent {
    /// Event with no scope and no arguments.
    pub fn new(command_name: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            command_name: command_name.into(),
            user_id: user_id.into(),
            scope_id: None,
            args: Vec::new(),
        }
    }

    /// Attach an invocation scope.
    #[must_use]
    pub fn in_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    /// Attach arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Routing and policy attributes given at registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMetadata {
    /// Grouping for help listings.
    pub category: String,
    /// Capabilities the user must hold.
    pub required_capabilities: BTreeSet<String>,
    /// Minimum time between two runs by the same user.
    pub cooldown: Duration,
    /// Additionally requires [`ADMIN_CAPABILITY`].
    pub admin_only: bool,
    /// Refuses events that carry no scope.
    pub scope_restricted: bool,
    /// One-line help text.
    pub description: String,
}

impl CommandMetadata {
    /// Metadata in `category` with no requirements.
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            ..Self::default()
        }
    }

    /// Require `capability`.
    #[must_use]
    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.insert(capability.into());
        self
    }

    /// Set the per-user cooldown.
    #[must_use]
    pub const fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    /// Restrict to administrators.
    #[must_use]
    pub const fn admin_only(mut self) -> Self {
        self.admin_only = true;
        self
    }

    /// Refuse events without a scope.
    #[must_use]
    pub const fn scope_restricted(mut self) -> Self {
        self.scope_restricted = true;
        self
    }

    /// Set the help text.
    #[must_use]
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }
}

/// Runs a command.
pub trait CommandHandler: Send + Sync + 'static {
    /// Handle `event`. An error is logged and reported to post-hooks.
    ///
    /// # Errors
    ///
    /// Whatever the command considers a failure.
    fn handle(&self, ctx: &ExecutionContext, event: &CommandEvent) -> AppResult<()>;
}

impl<F> CommandHandler for F
where
    F: Fn(&ExecutionContext, &CommandEvent) -> AppResult<()> + Send + Sync + 'static,
{
    fn handle(&self, ctx: &ExecutionContext, event: &CommandEvent) -> AppResult<()> {
        self(ctx, event)
    }
}

/// Decides whether a user holds a set of capabilities.
///
/// Implementations may be slow (a database or permissions service); the
/// registry caches every verdict for the configured TTL.
pub trait CapabilityChecker: Send + Sync + 'static {
    /// Whether `user_id`, acting in `scope_id`, holds every capability in `required`.
    fn has_capabilities(&self, user_id: &str, scope_id: Option<&str>, required: &BTreeSet<String>) -> bool;
}

impl<F> CapabilityChecker for F
where
    F: Fn(&str, Option<&str>, &BTreeSet<String>) -> bool + Send + Sync + 'static,
{
    fn has_capabilities(&self, user_id: &str, scope_id: Option<&str>, required: &BTreeSet<String>) -> bool {
        self(user_id, scope_id, required)
    }
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl CapabilityChecker for AllowAll {
    fn has_capabilities(&self, _user_id: &str, _scope_id: Option<&str>, _required: &BTreeSet<String>) -> bool {
        true
    }
}

/// A registered command. Immutable; re-registration replaces it.
pub struct CommandDescriptor {
    name: String,
    handler: Arc<dyn CommandHandler>,
    metadata: CommandMetadata,
    required: BTreeSet<String>,
}

impl CommandDescriptor {
    pub(crate) fn new(name: String, handler: Arc<dyn CommandHandler>, metadata: CommandMetadata) -> Self {
        let mut required = metadata.required_capabilities.clone();
        if metadata.admin_only {
            required.insert(ADMIN_CAPABILITY.to_owned());
        }
        Self {
            name,
            handler,
            metadata,
            required,
        }
    }

    /// Normalized name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metadata as registered.
    #[must_use]
    pub const fn metadata(&self) -> &CommandMetadata {
        &self.metadata
    }

    /// Category.
    #[must_use]
    pub fn category(&self) -> &str {
        &self.metadata.category
    }

    /// Every capability checked before the handler runs, including the admin one.
    #[must_use]
    pub const fn required_capabilities(&self) -> &BTreeSet<String> {
        &self.required
    }

    /// Per-user cooldown.
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        self.metadata.cooldown
    }

    /// Whether events without a scope are refused.
    #[must_use]
    pub const fn is_scope_restricted(&self) -> bool {
        self.metadata.scope_restricted
    }

    pub(crate) fn handler(&self) -> &dyn CommandHandler {
        self.handler.as_ref()
    }
}

impl fmt::Debug for CommandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDescriptor")
            .field("name", &self.name)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// How a dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum DispatchOutcome {
    /// No command by that name.
    Unknown,
    /// The capability check refused the user.
    Denied,
    /// The user ran this command too recently.
    CoolingDown {
        /// Time until the user may run it again.
        remaining: Duration,
    },
    /// The handler returned `Ok`.
    Completed,
    /// The handler returned an error or panicked.
    Failed,
}

impl DispatchOutcome {
    /// Whether the command was found and dispatch was attempted.
    #[must_use]
    pub const fn is_dispatched(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Per-invocation record handed to hooks and the handler.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    id: Uuid,
    descriptor: Arc<CommandDescriptor>,
    event: CommandEvent,
    started_at: Instant,
    duration: Option<Duration>,
    outcome: Option<DispatchOutcome>,
    failure: Option<String>,
}

impl ExecutionContext {
    pub(crate) fn new(descriptor: Arc<CommandDescriptor>, event: CommandEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            descriptor,
            event,
            started_at: Instant::now(),
            duration: None,
            outcome: None,
            failure: None,
        }
    }

    pub(crate) fn finish(&mut self, outcome: DispatchOutcome, failure: Option<String>) {
        self.duration = Some(self.started_at.elapsed());
        self.outcome = Some(outcome);
        self.failure = failure;
    }

    /// Unique id for log correlation.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// The resolved command.
    #[must_use]
    pub fn descriptor(&self) -> &CommandDescriptor {
        &self.descriptor
    }

    /// Normalized command name.
    #[must_use]
    pub fn command(&self) -> &str {
        self.descriptor.name()
    }

    /// The event being handled.
    #[must_use]
    pub const fn event(&self) -> &CommandEvent {
        &self.event
    }

    /// When dispatch began.
    #[must_use]
    pub const fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Whether dispatch has finished. Always true in post-hooks.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.outcome.is_some()
    }

    /// Time from start to finish, once finished.
    #[must_use]
    pub const fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// How dispatch ended, once finished.
    #[must_use]
    pub const fn outcome(&self) -> Option<DispatchOutcome> {
        self.outcome
    }

    /// Error text if the handler failed.
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}

/// Invocation count for one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandUsage {
    /// Normalized command name.
    pub command: String,
    /// Times dispatched.
    pub count: u64,
}

/// Callback run before or after every dispatched command.
pub type Hook = Arc<dyn Fn(&ExecutionContext) -> AppResult<()> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_only_adds_capability() {
        let metadata = CommandMetadata::new("moderation").requires("kick").admin_only();
        let handler = |_: &ExecutionContext, _: &CommandEvent| -> AppResult<()> { Ok(()) };
        let descriptor = CommandDescriptor::new("ban".into(), Arc::new(handler), metadata);
        let required: Vec<&str> = descriptor.required_capabilities().iter().map(String::as_str).collect();
        assert_eq!(required, vec!["admin", "kick"]);
        assert!(descriptor.metadata().required_capabilities.contains("kick"));
    }

    #[test]
    fn test_event_builder() {
        let event = CommandEvent::new("Ping", "u1").in_scope("guild-9").with_args(["a", "b"]);
        assert_eq!(event.scope_id.as_deref(), Some("guild-9"));
        assert_eq!(event.args, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let json = serde_json::to_string(&DispatchOutcome::Denied).unwrap();
        assert_eq!(json, r#"{"outcome":"denied"}"#);
        assert!(!DispatchOutcome::Unknown.is_dispatched());
        assert!(DispatchOutcome::Failed.is_dispatched());
    }
}
