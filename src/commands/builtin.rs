//! Commands every server starts with.

use std::io::Write;

use super::{Command, CommandRegistry, Outcome, WeakRegistry};

/// Echoes its arguments back as `Test: [a b c]`.
pub struct TestCommand;

impl Command for TestCommand {
    fn run(&self, out: &mut dyn Write, args: &[String]) -> Outcome {
        match writeln!(out, "Test: [{}]", args.join(" ")) {
            Ok(()) => Outcome::Continue,
            Err(e) => Outcome::Fail(e.to_string()),
        }
    }
}

/// Ends the interactive session.
pub struct ExitCommand;

impl Command for ExitCommand {
    fn run(&self, _out: &mut dyn Write, _args: &[String]) -> Outcome {
        Outcome::Terminate
    }
}

/// Lists the commands registered on the owning server.
pub struct HelpCommand {
    registry: WeakRegistry,
}

impl Command for HelpCommand {
    fn run(&self, out: &mut dyn Write, _args: &[String]) -> Outcome {
        let names = self
            .registry
            .upgrade()
            .map(|registry| registry.names())
            .unwrap_or_default();
        if let Err(e) = writeln!(out, "Commands: {}", names.join(", ")) {
            return Outcome::Fail(e.to_string());
        }
        Outcome::Continue
    }
}

/// Register `test`, `exit` and `help` on `registry`.
pub fn register_builtins(registry: &CommandRegistry) {
    registry.register("test", TestCommand);
    registry.register("exit", ExitCommand);
    registry.register(
        "help",
        HelpCommand {
            registry: registry.downgrade(),
        },
    );
}
