//! Ordered command-line dispatcher.
//!
//! Descriptors execute in registration order, not in the order the user
//! typed them. Options are non-terminal flags (possibly `--flag=value`);
//! subcommands are terminal — once one fires, the rest of the command line
//! belongs to it and the scan stops.

use crate::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Option,
    SubCommand,
}

/// Delegate bound to an argument descriptor. Receives the argv tail starting
/// at the matched token.
pub type ArgDelegate<C> = fn(&mut C, &[String]) -> Result<()>;

struct CliArg<C> {
    names: &'static [&'static str],
    desc: &'static str,
    kind: ArgKind,
    delegate: ArgDelegate<C>,
    order: u8,
}

pub struct Cli<C> {
    bin_name: String,
    args: Vec<CliArg<C>>,
    next_order: u8,
}

/// Extract the value of a `--flag=value` token.
pub fn value_of(token: &str) -> Option<&str> {
    token
        .split_once('=')
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

impl<C> Cli<C> {
    pub fn new(bin_name: impl Into<String>) -> Self {
        Self {
            bin_name: bin_name.into(),
            args: Vec::new(),
            next_order: 0,
        }
    }

    /// Register a descriptor with up to two aliases. Registration order is
    /// execution order.
    pub fn add(
        &mut self,
        names: &'static [&'static str],
        desc: &'static str,
        kind: ArgKind,
        delegate: ArgDelegate<C>,
    ) {
        let order = self.next_order;
        self.next_order += 1;
        self.args.push(CliArg {
            names,
            desc,
            kind,
            delegate,
            order,
        });
    }

    /// Run the pipeline over `argv`. Returns `Ok(false)` when the invocation
    /// did nothing but print usage.
    pub fn dispatch(&mut self, ctx: &mut C, argv: &[String]) -> Result<bool> {
        if argv.len() <= 1 {
            self.print_usage();
            return Ok(false);
        }

        self.args.sort_by_key(|arg| arg.order);

        // Tracks which argv slots were claimed; a slot left unclaimed after
        // the scan is an unknown argument, unless a subcommand owns the tail.
        let mut parsed: Vec<Option<ArgKind>> = vec![None; argv.len()];

        for arg in &self.args {
            let position = argv.iter().position(|token| {
                let head = token.split_once('=').map_or(token.as_str(), |(head, _)| head);
                arg.names.contains(&head)
            });
            let Some(position) = position else { continue };

            parsed[position] = Some(arg.kind);
            (arg.delegate)(ctx, &argv[position..])?;
            if arg.kind == ArgKind::SubCommand {
                break;
            }
        }

        for (token, kind) in argv.iter().zip(&parsed).skip(1) {
            match kind {
                None => {
                    return Err(Error::with_message(
                        ErrorKind::UnknownCommand,
                        format!("Unknown argument '{token}'."),
                    ));
                }
                Some(ArgKind::SubCommand) => break,
                Some(ArgKind::Option) => {}
            }
        }

        Ok(true)
    }

    fn print_usage(&self) {
        println!("Usage:\n\t{} <options> [command] [<args>]", self.bin_name);
        println!("\nArguments:");
        for arg in &self.args {
            println!("\t{}\t\t{}", arg.names.join(" | "), arg.desc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        fired: Vec<&'static str>,
        tail: Vec<String>,
    }

    fn argv(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    fn opt_daemon(ctx: &mut Recorder, _args: &[String]) -> crate::error::Result<()> {
        ctx.fired.push("daemon");
        Ok(())
    }

    fn opt_rc(ctx: &mut Recorder, _args: &[String]) -> crate::error::Result<()> {
        ctx.fired.push("rc");
        Ok(())
    }

    fn sub_root(ctx: &mut Recorder, args: &[String]) -> crate::error::Result<()> {
        ctx.fired.push("root");
        ctx.tail = args.to_vec();
        Ok(())
    }

    fn failing(_ctx: &mut Recorder, _args: &[String]) -> crate::error::Result<()> {
        Err(Error::new(ErrorKind::InvalidState))
    }

    #[test]
    fn registration_order_wins_over_argv_order() {
        let mut cli = Cli::new("bin");
        cli.add(&["--daemon", "-d"], "daemon", ArgKind::Option, opt_daemon);
        cli.add(&["--rc", "-r"], "root complex", ArgKind::Option, opt_rc);

        let mut ctx = Recorder::default();
        let handled = cli
            .dispatch(&mut ctx, &argv(&["bin", "--rc", "--daemon"]))
            .expect("dispatch");
        assert!(handled);
        assert_eq!(ctx.fired, vec!["daemon", "rc"]);
    }

    #[test]
    fn unknown_argument_is_reported() {
        let mut cli = Cli::new("bin");
        cli.add(&["--daemon", "-d"], "daemon", ArgKind::Option, opt_daemon);

        let mut ctx = Recorder::default();
        let err = cli
            .dispatch(&mut ctx, &argv(&["bin", "--foo"]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownCommand);
        assert!(err.message().unwrap_or_default().contains("--foo"));
    }

    #[test]
    fn subcommand_owns_its_tail() {
        let mut cli = Cli::new("bin");
        cli.add(&["root", "rc"], "talk to rc", ArgKind::SubCommand, sub_root);

        let mut ctx = Recorder::default();
        let handled = cli
            .dispatch(&mut ctx, &argv(&["bin", "rc", "reboot"]))
            .expect("dispatch");
        assert!(handled);
        assert_eq!(ctx.fired, vec!["root"]);
        assert_eq!(ctx.tail, argv(&["rc", "reboot"]));
    }

    #[test]
    fn subcommand_stops_descriptor_scan() {
        let mut cli = Cli::new("bin");
        cli.add(&["go"], "go", ArgKind::SubCommand, sub_root);
        cli.add(&["--daemon", "-d"], "daemon", ArgKind::Option, opt_daemon);

        let mut ctx = Recorder::default();
        let handled = cli
            .dispatch(&mut ctx, &argv(&["bin", "go", "--daemon"]))
            .expect("dispatch");
        assert!(handled);
        assert_eq!(ctx.fired, vec!["root"]);
    }

    #[test]
    fn delegate_errors_propagate() {
        let mut cli = Cli::new("bin");
        cli.add(&["--bad"], "bad", ArgKind::Option, failing);

        let mut ctx = Recorder::default();
        let err = cli.dispatch(&mut ctx, &argv(&["bin", "--bad"])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[test]
    fn bare_invocation_prints_usage_and_does_nothing() {
        let mut cli = Cli::new("bin");
        cli.add(&["--daemon", "-d"], "daemon", ArgKind::Option, opt_daemon);

        let mut ctx = Recorder::default();
        let handled = cli.dispatch(&mut ctx, &argv(&["bin"])).expect("dispatch");
        assert!(!handled);
        assert!(ctx.fired.is_empty());
    }

    #[test]
    fn option_matches_its_value_form() {
        let mut cli = Cli::new("bin");
        fn capture(ctx: &mut Recorder, args: &[String]) -> crate::error::Result<()> {
            ctx.tail = args.to_vec();
            Ok(())
        }
        cli.add(&["--camconf", "-cf"], "config", ArgKind::Option, capture);

        let mut ctx = Recorder::default();
        cli.dispatch(&mut ctx, &argv(&["bin", "--camconf=/tmp/cams.json"]))
            .expect("dispatch");
        assert_eq!(ctx.tail, argv(&["--camconf=/tmp/cams.json"]));
    }

    #[test]
    fn value_of_extracts_assignment() {
        assert_eq!(value_of("--camconf=/tmp/x.json"), Some("/tmp/x.json"));
        assert_eq!(value_of("--camconf="), None);
        assert_eq!(value_of("--camconf"), None);
    }
}
