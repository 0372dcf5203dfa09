//! Command registry for the interactive shell.
//!
//! Each server instance owns one [`CommandRegistry`]. Commands are looked up
//! by name or by an unambiguous prefix of their name, and may optionally
//! offer argument candidates for tab-completion (see [`complete`]).

pub mod builtin;
pub mod complete;

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use thiserror::Error;

/// Result of running a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The command finished; keep reading input.
    Continue,
    /// The command failed. The detail is logged, never sent to the client;
    /// a command that wants the user to see a failure writes it itself.
    Fail(String),
    /// End the interactive session.
    Terminate,
}

/// A command that can be registered with a [`CommandRegistry`].
pub trait Command: Send + Sync {
    /// Run the command, writing any output to `out`.
    fn run(&self, out: &mut dyn Write, args: &[String]) -> Outcome;

    /// Candidate arguments for tab-completion, in display order.
    ///
    /// `None` means the command offers no argument completion.
    fn complete(&self) -> Option<Vec<String>> {
        None
    }
}

type CommandTable = HashMap<String, Arc<dyn Command>>;
type RunFn = dyn Fn(&mut dyn Write, &[String]) -> Outcome + Send + Sync;
type CompleteFn = dyn Fn() -> Vec<String> + Send + Sync;

/// A [`Command`] built from closures.
pub struct FnCommand {
    run: Box<RunFn>,
    complete: Option<Box<CompleteFn>>,
}

impl FnCommand {
    pub fn new<F>(run: F) -> Self
    where
        F: Fn(&mut dyn Write, &[String]) -> Outcome + Send + Sync + 'static,
    {
        Self {
            run: Box::new(run),
            complete: None,
        }
    }

    /// Attach a completion provider.
    pub fn with_completions<C>(mut self, complete: C) -> Self
    where
        C: Fn() -> Vec<String> + Send + Sync + 'static,
    {
        self.complete = Some(Box::new(complete));
        self
    }
}

impl Command for FnCommand {
    fn run(&self, out: &mut dyn Write, args: &[String]) -> Outcome {
        (self.run)(out, args)
    }

    fn complete(&self) -> Option<Vec<String>> {
        self.complete.as_ref().map(|c| c())
    }
}

/// Errors from [`CommandRegistry::exec`].
///
/// The `Display` text of each variant is exactly the output a client would
/// have seen for the failed line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("invalid quoting in command line: {0}")]
    Parse(String),

    #[error("Unknown command: {0}\n")]
    UnknownCommand(String),
}

/// Name-to-command table, safe to share between connection tasks.
///
/// Cloning the registry shares the underlying table; separate
/// `CommandRegistry::new()` calls produce independent tables.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    inner: Arc<RwLock<CommandTable>>,
}

/// Non-owning handle to a [`CommandRegistry`], for commands that need to
/// inspect the registry they live in.
#[derive(Clone)]
pub struct WeakRegistry {
    inner: Weak<RwLock<CommandTable>>,
}

impl WeakRegistry {
    pub fn upgrade(&self) -> Option<CommandRegistry> {
        self.inner.upgrade().map(|inner| CommandRegistry { inner })
    }
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn downgrade(&self) -> WeakRegistry {
        WeakRegistry {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Register `command` under `name`, replacing any previous entry.
    ///
    /// Names are stored lowercased.
    pub fn register<C: Command + 'static>(&self, name: &str, command: C) {
        self.register_arc(name, Arc::new(command));
    }

    /// Register an already shared command.
    pub fn register_arc(&self, name: &str, command: Arc<dyn Command>) {
        let name = name.to_lowercase();
        tracing::debug!(command = %name, "registering command");
        self.inner.write().insert(name, command);
    }

    /// Resolve a command name or unambiguous prefix.
    ///
    /// An exact name always wins. Otherwise the prefix must match exactly one
    /// registered name; ambiguous and unknown prefixes both return `None`.
    pub fn lookup(&self, prefix: &str) -> Option<(String, Arc<dyn Command>)> {
        let prefix = prefix.to_lowercase();
        let inner = self.inner.read();

        if let Some(command) = inner.get(&prefix) {
            return Some((prefix, Arc::clone(command)));
        }

        let mut found: Option<(&String, &Arc<dyn Command>)> = None;
        for (name, command) in inner.iter() {
            if name.starts_with(&prefix) {
                if found.is_some() {
                    return None;
                }
                found = Some((name, command));
            }
        }
        found.map(|(name, command)| (name.clone(), Arc::clone(command)))
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Run one command line outside of any terminal.
    ///
    /// Unlike the interactive loop, arguments are split with shell quoting
    /// rules, so `test "hello world"` passes a single argument. Returns the
    /// captured output. Command failures are not errors here: only a
    /// malformed line or an unresolvable command name is.
    pub fn exec(&self, line: &str) -> Result<String, ExecError> {
        let fields = shlex::split(line).ok_or_else(|| ExecError::Parse(line.to_string()))?;
        let Some((name, args)) = fields.split_first() else {
            return Ok(String::new());
        };

        let Some((resolved, command)) = self.lookup(name) else {
            return Err(ExecError::UnknownCommand(name.clone()));
        };

        let mut out = Vec::new();
        match command.run(&mut out, args) {
            Outcome::Continue | Outcome::Terminate => {}
            Outcome::Fail(detail) => {
                tracing::debug!(command = %resolved, %detail, "batch command failed");
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> FnCommand {
        FnCommand::new(|_, _| Outcome::Continue)
    }

    fn echo(tag: &'static str) -> FnCommand {
        FnCommand::new(move |out, _| {
            let _ = write!(out, "{tag}");
            Outcome::Continue
        })
    }

    fn registry_with(names: &[&str]) -> CommandRegistry {
        let registry = CommandRegistry::new();
        for name in names {
            registry.register(name, noop());
        }
        registry
    }

    #[test]
    fn exact_name_resolves() {
        let registry = registry_with(&["status", "stop", "help"]);
        for name in ["status", "stop", "help"] {
            let (resolved, _) = registry.lookup(name).expect("exact name should resolve");
            assert_eq!(resolved, name);
        }
    }

    #[test]
    fn unique_prefix_resolves() {
        let registry = registry_with(&["status", "help"]);
        assert_eq!(registry.lookup("st").unwrap().0, "status");
        assert_eq!(registry.lookup("h").unwrap().0, "help");
    }

    #[test]
    fn ambiguous_prefix_fails() {
        let registry = registry_with(&["run", "runner"]);
        assert!(registry.lookup("ru").is_none());
        assert!(registry.lookup("r").is_none());
    }

    #[test]
    fn exact_match_beats_longer_name() {
        let registry = registry_with(&["run", "runner"]);
        assert_eq!(registry.lookup("run").unwrap().0, "run");
        assert_eq!(registry.lookup("runn").unwrap().0, "runner");
    }

    #[test]
    fn unknown_prefix_fails() {
        let registry = registry_with(&["run"]);
        assert!(registry.lookup("walk").is_none());
        assert!(registry.lookup("runs").is_none());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = registry_with(&["Status"]);
        assert_eq!(registry.names(), vec!["status".to_string()]);
        assert_eq!(registry.lookup("STAT").unwrap().0, "status");
    }

    #[test]
    fn register_overwrites_by_name() {
        let registry = CommandRegistry::new();
        registry.register("greet", echo("first"));
        registry.register("GREET", echo("second"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.exec("greet").unwrap(), "second");
    }

    #[test]
    fn registries_are_independent() {
        let a = registry_with(&["alpha"]);
        let b = registry_with(&["beta"]);
        assert!(a.lookup("beta").is_none());
        assert!(b.lookup("alpha").is_none());

        let shared = a.clone();
        shared.register("gamma", noop());
        assert!(a.lookup("gamma").is_some());
    }

    #[test]
    fn completion_provider_is_optional() {
        let plain = noop();
        assert!(plain.complete().is_none());

        let with = noop().with_completions(|| vec!["x".into(), "y".into()]);
        assert_eq!(with.complete(), Some(vec!["x".to_string(), "y".to_string()]));
    }

    #[test]
    fn exec_splits_quoted_arguments() {
        let registry = CommandRegistry::new();
        registry.register(
            "args",
            FnCommand::new(|out, args| {
                let _ = write!(out, "{}", args.join("|"));
                Outcome::Continue
            }),
        );
        assert_eq!(registry.exec(r#"args "a b" c 'd e'"#).unwrap(), "a b|c|d e");
    }

    #[test]
    fn exec_unknown_command() {
        let registry = registry_with(&["run"]);
        let err = registry.exec("bogus").unwrap_err();
        assert_eq!(err, ExecError::UnknownCommand("bogus".into()));
        assert_eq!(err.to_string(), "Unknown command: bogus\n");
    }

    #[test]
    fn exec_ambiguous_prefix_is_unknown() {
        let registry = registry_with(&["run", "runner"]);
        assert!(matches!(registry.exec("ru"), Err(ExecError::UnknownCommand(_))));
    }

    #[test]
    fn exec_unbalanced_quote_is_parse_error() {
        let registry = registry_with(&["run"]);
        let err = registry.exec(r#"run "oops"#).unwrap_err();
        assert!(matches!(err, ExecError::Parse(_)));
    }

    #[test]
    fn exec_empty_line_is_empty_output() {
        let registry = registry_with(&["run"]);
        assert_eq!(registry.exec("   ").unwrap(), "");
    }

    #[test]
    fn exec_ignores_command_failure() {
        let registry = CommandRegistry::new();
        registry.register(
            "fail",
            FnCommand::new(|out, _| {
                let _ = write!(out, "partial");
                Outcome::Fail("boom".into())
            }),
        );
        assert_eq!(registry.exec("fail").unwrap(), "partial");
    }

    #[test]
    fn concurrent_register_and_lookup() {
        let registry = CommandRegistry::new();
        registry.register("base", noop());

        let writers: Vec<_> = (0..4)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        registry.register(&format!("cmd{i}x{j}"), noop());
                    }
                })
            })
            .collect();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        assert!(registry.lookup("base").is_some());
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 401);
    }
}
