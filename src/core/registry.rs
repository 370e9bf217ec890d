//! Case-insensitive command routing with cached lookups.
//!
//! Dispatch runs a fixed pipeline for every known command:
//!
//! 1. pre-hooks
//! 2. capability check (verdicts cached per `(command, user, scope)` for a TTL)
//! 3. cooldown check
//! 4. the handler
//! 5. post-hooks, always, even when an earlier step refused or failed
//!
//! A failing hook is logged and skipped. A failing or panicking handler is
//! logged and reported to post-hooks; neither aborts dispatch.

mod command;

use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub use command::{
    AllowAll, CapabilityChecker, CommandDescriptor, CommandEvent, CommandHandler,
    CommandMetadata, CommandUsage, DispatchOutcome, ExecutionContext, Hook, ADMIN_CAPABILITY,
};

use crate::config::RegistryConfig;
use crate::core::{AppResult, CacheStats, ScheduleHandle, TaskDispatcher, TtlCache, WorkloadClass};
use crate::util::panic_message;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CapabilityKey {
    command: String,
    user: String,
    scope: Option<String>,
}

/// Dispatch counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    /// Registered commands.
    pub commands: usize,
    /// Dispatches of known commands.
    pub dispatched: u64,
    /// Events naming no registered command.
    pub unknown: u64,
    /// Dispatches refused by the capability check.
    pub denied: u64,
    /// Dispatches refused by a cooldown.
    pub cooling_down: u64,
    /// Handlers that returned an error or panicked.
    pub failed: u64,
    /// Calls made to the capability checker (cache misses).
    pub capability_checks: u64,
    /// Resolved-handler cache.
    pub handler_cache: CacheStats,
    /// Capability verdict cache.
    pub capability_cache: CacheStats,
}

#[derive(Debug, Default)]
struct DispatchCounters {
    dispatched: AtomicU64,
    unknown: AtomicU64,
    denied: AtomicU64,
    cooling_down: AtomicU64,
    failed: AtomicU64,
    capability_checks: AtomicU64,
}

/// Maps normalized command names to handlers and runs the dispatch pipeline.
pub struct CommandRegistry {
    commands: DashMap<String, Arc<CommandDescriptor>>,
    categories: DashMap<String, BTreeSet<String>>,
    usage: DashMap<String, AtomicU64>,
    cooldowns: DashMap<(String, String), Instant>,
    handler_cache: TtlCache<String, Arc<CommandDescriptor>>,
    capability_cache: TtlCache<CapabilityKey, bool>,
    pre_hooks: RwLock<Arc<Vec<Hook>>>,
    post_hooks: RwLock<Arc<Vec<Hook>>>,
    checker: Arc<dyn CapabilityChecker>,
    dispatcher: Option<TaskDispatcher>,
    counters: DispatchCounters,
}

/// Lowercased, trimmed command name.
#[must_use]
pub fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

impl CommandRegistry {
    /// Empty registry using `checker` for capability checks.
    pub fn new(config: &RegistryConfig, checker: impl CapabilityChecker) -> Self {
        Self::with_checker(config, Arc::new(checker))
    }

    /// Empty registry sharing an existing checker.
    #[must_use]
    pub fn with_checker(config: &RegistryConfig, checker: Arc<dyn CapabilityChecker>) -> Self {
        let shards = config.cache_shards.max(1);
        Self {
            commands: DashMap::new(),
            categories: DashMap::new(),
            usage: DashMap::new(),
            cooldowns: DashMap::new(),
            handler_cache: TtlCache::new(config.handler_cache_capacity, shards, config.handler_cache_ttl()),
            capability_cache: TtlCache::new(
                config.capability_cache_capacity,
                shards,
                config.capability_cache_ttl(),
            ),
            pre_hooks: RwLock::new(Arc::new(Vec::new())),
            post_hooks: RwLock::new(Arc::new(Vec::new())),
            checker,
            dispatcher: None,
            counters: DispatchCounters::default(),
        }
    }

    /// Run post-hooks on the general pool of `dispatcher` instead of the
    /// calling thread.
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: TaskDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Register `handler` under `name`. Replaces (and logs) any previous
    /// registration of the same normalized name, returning it.
    pub fn register(
        &self,
        name: &str,
        handler: impl CommandHandler,
        metadata: CommandMetadata,
    ) -> Option<Arc<CommandDescriptor>> {
        let name = normalize(name);
        let category = metadata.category.clone();
        let descriptor = Arc::new(CommandDescriptor::new(name.clone(), Arc::new(handler), metadata));

        let previous = self.commands.insert(name.clone(), descriptor);
        if let Some(previous) = &previous {
            warn!(command = %name, "command re-registered, overriding previous handler");
            if previous.category() != category {
                self.leave_category(previous.category(), &name);
            }
            self.forget_cached(&name);
        }
        self.categories.entry(category).or_default().insert(name.clone());
        debug!(command = %name, "command registered");
        previous
    }

    /// Remove `name` with its usage count, category membership, cooldowns and
    /// cached lookups. Returns whether it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        let name = normalize(name);
        let Some((_, descriptor)) = self.commands.remove(&name) else {
            return false;
        };
        self.usage.remove(&name);
        self.leave_category(descriptor.category(), &name);
        self.cooldowns.retain(|(command, _), _| command != &name);
        self.forget_cached(&name);
        debug!(command = %name, "command unregistered");
        true
    }

    fn leave_category(&self, category: &str, name: &str) {
        if let Some(mut members) = self.categories.get_mut(category) {
            members.remove(name);
        }
        self.categories.remove_if(category, |_, members| members.is_empty());
    }

    fn forget_cached(&self, name: &str) {
        self.handler_cache.invalidate(&name.to_owned());
        self.capability_cache.invalidate_where(|key| key.command == name);
    }

    /// Add a hook run before every dispatched command, after those already added.
    pub fn add_pre_hook<H>(&self, hook: H)
    where
        H: Fn(&ExecutionContext) -> AppResult<()> + Send + Sync + 'static,
    {
        push_hook(&self.pre_hooks, Arc::new(hook));
    }

    /// Add a hook run after every dispatched command, after those already added.
    pub fn add_post_hook<H>(&self, hook: H)
    where
        H: Fn(&ExecutionContext) -> AppResult<()> + Send + Sync + 'static,
    {
        push_hook(&self.post_hooks, Arc::new(hook));
    }

    /// Dispatch `event`. False only when no command has that name.
    pub fn execute(&self, event: &CommandEvent) -> bool {
        self.execute_detailed(event).is_dispatched()
    }

    /// Dispatch `event` and report how it ended.
    pub fn execute_detailed(&self, event: &CommandEvent) -> DispatchOutcome {
        let name = normalize(&event.command_name);
        let Some(descriptor) = self.resolve(&name) else {
            self.counters.unknown.fetch_add(1, Ordering::Relaxed);
            debug!(command = %name, user = %event.user_id, "unknown command");
            return DispatchOutcome::Unknown;
        };

        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.usage
            .entry(name.clone())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);

        let mut ctx = ExecutionContext::new(Arc::clone(&descriptor), event.clone());
        let pre_hooks = Arc::clone(&self.pre_hooks.read());
        run_hooks(&pre_hooks, &ctx, "pre");

        let mut failure = None;
        let outcome = if !self.is_authorized(&descriptor, event) {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
            debug!(command = %name, user = %event.user_id, "capability check denied");
            DispatchOutcome::Denied
        } else if let Some(remaining) = self.cooldown_remaining(&descriptor, &event.user_id) {
            self.counters.cooling_down.fetch_add(1, Ordering::Relaxed);
            debug!(command = %name, user = %event.user_id, ?remaining, "command on cooldown");
            DispatchOutcome::CoolingDown { remaining }
        } else {
            let ran = panic::catch_unwind(AssertUnwindSafe(|| descriptor.handler().handle(&ctx, event)));
            match ran {
                Ok(Ok(())) => DispatchOutcome::Completed,
                Ok(Err(e)) => {
                    warn!(command = %name, context = %ctx.id(), error = %e, "command handler failed");
                    failure = Some(format!("{e:#}"));
                    DispatchOutcome::Failed
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(command = %name, context = %ctx.id(), panic = %message, "command handler panicked");
                    failure = Some(message);
                    DispatchOutcome::Failed
                }
            }
        };
        if outcome == DispatchOutcome::Failed {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        ctx.finish(outcome, failure);

        let post_hooks = Arc::clone(&self.post_hooks.read());
        match &self.dispatcher {
            Some(dispatcher) if !post_hooks.is_empty() => {
                dispatcher.offload(WorkloadClass::General, move || run_hooks(&post_hooks, &ctx, "post"));
            }
            _ => run_hooks(&post_hooks, &ctx, "post"),
        }
        outcome
    }

    fn resolve(&self, name: &str) -> Option<Arc<CommandDescriptor>> {
        let key = name.to_owned();
        if let Some(descriptor) = self.handler_cache.get(&key) {
            return Some(descriptor);
        }
        let descriptor = self.commands.get(name).map(|entry| Arc::clone(entry.value()))?;
        self.handler_cache.insert(key.clone(), Arc::clone(&descriptor));
        // A concurrent register or unregister may have invalidated before our insert.
        let current = self
            .commands
            .get(name)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), &descriptor));
        if !current {
            self.handler_cache.invalidate(&key);
        }
        Some(descriptor)
    }

    fn is_authorized(&self, descriptor: &CommandDescriptor, event: &CommandEvent) -> bool {
        if descriptor.is_scope_restricted() && event.scope_id.is_none() {
            return false;
        }
        let required = descriptor.required_capabilities();
        if required.is_empty() {
            return true;
        }

        let key = CapabilityKey {
            command: descriptor.name().to_owned(),
            user: event.user_id.clone(),
            scope: event.scope_id.clone(),
        };
        if let Some(allowed) = self.capability_cache.get(&key) {
            return allowed;
        }

        self.counters.capability_checks.fetch_add(1, Ordering::Relaxed);
        let checked = panic::catch_unwind(AssertUnwindSafe(|| {
            self.checker
                .has_capabilities(&event.user_id, event.scope_id.as_deref(), required)
        }));
        let allowed = checked.unwrap_or_else(|payload| {
            warn!(
                command = %descriptor.name(),
                panic = %panic_message(payload.as_ref()),
                "capability checker panicked, denying"
            );
            false
        });
        self.capability_cache.insert(key, allowed);
        allowed
    }

    /// Remaining cooldown for `user`, or `None` after starting a new window.
    fn cooldown_remaining(&self, descriptor: &CommandDescriptor, user: &str) -> Option<Duration> {
        let cooldown = descriptor.cooldown();
        if cooldown.is_zero() {
            return None;
        }
        let now = Instant::now();
        match self.cooldowns.entry((descriptor.name().to_owned(), user.to_owned())) {
            Entry::Occupied(mut last) => {
                let elapsed = now.saturating_duration_since(*last.get());
                if elapsed < cooldown {
                    Some(cooldown - elapsed)
                } else {
                    last.insert(now);
                    None
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                None
            }
        }
    }

    /// Descriptor registered under `name`.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Arc<CommandDescriptor>> {
        self.commands
            .get(&normalize(name))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(&normalize(name))
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.commands.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Categories with at least one command, sorted.
    #[must_use]
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self.categories.iter().map(|e| e.key().clone()).collect();
        categories.sort();
        categories
    }

    /// Commands in `category`, sorted.
    #[must_use]
    pub fn commands_in_category(&self, category: &str) -> Vec<String> {
        self.categories
            .get(category)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Times `name` has been dispatched.
    #[must_use]
    pub fn usage(&self, name: &str) -> u64 {
        self.usage
            .get(&normalize(name))
            .map_or(0, |count| count.load(Ordering::Relaxed))
    }

    /// The `n` most used commands, most used first; ties by name.
    #[must_use]
    pub fn top_commands(&self, n: usize) -> Vec<CommandUsage> {
        let mut all: Vec<CommandUsage> = self
            .usage
            .iter()
            .map(|entry| CommandUsage {
                command: entry.key().clone(),
                count: entry.value().load(Ordering::Relaxed),
            })
            .collect();
        all.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.command.cmp(&b.command)));
        all.truncate(n);
        all
    }

    /// Drop cached capability verdicts for `user`, e.g. after their roles change.
    pub fn invalidate_user(&self, user: &str) -> usize {
        self.capability_cache.invalidate_where(|key| key.user == user)
    }

    /// Sweep expired cache entries and elapsed cooldowns. Returns entries removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.cooldowns.len();
        self.cooldowns.retain(|(command, _), last| {
            self.commands
                .get(command)
                .is_some_and(|d| now.saturating_duration_since(*last) < d.cooldown())
        });
        let cooldowns = before.saturating_sub(self.cooldowns.len());
        self.handler_cache.evict_expired() + self.capability_cache.evict_expired() + cooldowns
    }

    /// Run [`evict_expired`](Self::evict_expired) every `period` on the scheduled class.
    pub fn schedule_maintenance(self: &Arc<Self>, dispatcher: &TaskDispatcher, period: Duration) -> ScheduleHandle {
        let registry = Arc::downgrade(self);
        dispatcher.schedule_periodic(
            move || {
                if let Some(registry) = registry.upgrade() {
                    let removed = registry.evict_expired();
                    if removed > 0 {
                        debug!(removed, "registry cache sweep");
                    }
                }
                Ok(())
            },
            period,
            period,
        )
    }

    /// Handler cache counters.
    #[must_use]
    pub fn handler_cache_stats(&self) -> CacheStats {
        self.handler_cache.stats()
    }

    /// Capability cache counters.
    #[must_use]
    pub fn capability_cache_stats(&self) -> CacheStats {
        self.capability_cache.stats()
    }

    /// Dispatch and cache counters.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let c = &self.counters;
        RegistryStats {
            commands: self.commands.len(),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            unknown: c.unknown.load(Ordering::Relaxed),
            denied: c.denied.load(Ordering::Relaxed),
            cooling_down: c.cooling_down.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            capability_checks: c.capability_checks.load(Ordering::Relaxed),
            handler_cache: self.handler_cache.stats(),
            capability_cache: self.capability_cache.stats(),
        }
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.commands.len())
            .field("pre_hooks", &self.pre_hooks.read().len())
            .field("post_hooks", &self.post_hooks.read().len())
            .finish_non_exhaustive()
    }
}

fn push_hook(hooks: &RwLock<Arc<Vec<Hook>>>, hook: Hook) {
    let mut guard = hooks.write();
    let mut next = Vec::clone(&guard);
    next.push(hook);
    *guard = Arc::new(next);
}

fn run_hooks(hooks: &[Hook], ctx: &ExecutionContext, phase: &'static str) {
    for (index, hook) in hooks.iter().enumerate() {
        match panic::catch_unwind(AssertUnwindSafe(|| hook(ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(phase, index, command = %ctx.command(), error = %e, "hook failed");
            }
            Err(payload) => {
                warn!(
                    phase,
                    index,
                    command = %ctx.command(),
                    panic = %panic_message(payload.as_ref()),
                    "hook panicked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn noop() -> impl CommandHandler {
        |_: &ExecutionContext, _: &CommandEvent| -> AppResult<()> { Ok(()) }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  PiNg "), "ping");
    }

    #[test]
    fn test_override_moves_category() {
        let registry = CommandRegistry::new(&RegistryConfig::default(), AllowAll);
        assert!(registry.register("stats", noop(), CommandMetadata::new("info")).is_none());
        assert!(registry.register("STATS", noop(), CommandMetadata::new("admin")).is_some());
        assert_eq!(registry.categories(), vec!["admin".to_string()]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_scope_restricted_denied_without_scope() {
        let calls = Arc::new(AtomicUsize::new(0));
        let checker_calls = Arc::clone(&calls);
        let registry = CommandRegistry::new(
            &RegistryConfig::default(),
            move |_: &str, _: Option<&str>, _: &BTreeSet<String>| {
                checker_calls.fetch_add(1, Ordering::SeqCst);
                true
            },
        );
        registry.register("ticket", noop(), CommandMetadata::new("support").scope_restricted());
        let outcome = registry.execute_detailed(&CommandEvent::new("ticket", "u1"));
        assert_eq!(outcome, DispatchOutcome::Denied);
        let outcome = registry.execute_detailed(&CommandEvent::new("ticket", "u1").in_scope("g1"));
        assert_eq!(outcome, DispatchOutcome::Completed);
        // No declared capabilities, so the checker is never consulted.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cooldown_window() {
        let registry = CommandRegistry::new(&RegistryConfig::default(), AllowAll);
        registry.register(
            "daily",
            noop(),
            CommandMetadata::new("economy").cooldown(Duration::from_secs(60)),
        );
        let event = CommandEvent::new("daily", "u1");
        assert_eq!(registry.execute_detailed(&event), DispatchOutcome::Completed);
        assert!(matches!(
            registry.execute_detailed(&event),
            DispatchOutcome::CoolingDown { remaining } if remaining <= Duration::from_secs(60)
        ));
        assert_eq!(
            registry.execute_detailed(&CommandEvent::new("daily", "u2")),
            DispatchOutcome::Completed
        );
        assert_eq!(registry.usage("daily"), 3);
    }
}
