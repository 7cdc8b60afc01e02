//! Dot-command parsing.
//!
//! The command word is matched against a closed table by unique prefix, so
//! `.ru` means `.run` while `.r` is rejected as ambiguous with `.repeats`.

use thiserror::Error;

/// A parsed dot-command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Print the accumulated batch.
    List,
    /// Close this session.
    Quit,
    /// Execute the batch in a loop.
    Run,
    /// Bound the next run by iteration count.
    Repeats(i64),
    /// Bound the next run by wall-clock seconds.
    Seconds(i64),
    /// Append a `COMMIT` executed under the process-wide commit mutex.
    MutexCommit,
    /// Set this session's local checkpoint threshold in WAL frames.
    Checkpoint(i64),
    /// Close the store and stop the whole server.
    Stop,
    /// Append an integrity check whose result must be `ok`.
    IntegrityCheck,
}

#[derive(Clone, Copy)]
enum Kind {
    List,
    Quit,
    Run,
    Repeats,
    Seconds,
    MutexCommit,
    Checkpoint,
    Stop,
    IntegrityCheck,
}

const COMMANDS: &[(&str, Kind)] = &[
    ("list", Kind::List),
    ("quit", Kind::Quit),
    ("run", Kind::Run),
    ("repeats", Kind::Repeats),
    ("seconds", Kind::Seconds),
    ("mutex_commit", Kind::MutexCommit),
    ("checkpoint", Kind::Checkpoint),
    ("stop", Kind::Stop),
    ("integrity_check", Kind::IntegrityCheck),
];

/// Reasons a dot-command line is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// No command starts with the given word.
    #[error("unrecognized command: .{0}")]
    Unrecognized(String),
    /// More than one command starts with the given word.
    #[error("ambiguous command: .{0}")]
    Ambiguous(String),
    /// The command needs an integer argument.
    #[error(".{0} expects an integer argument")]
    BadArgument(&'static str),
}

/// Names of all commands, in table order.
pub fn command_names() -> impl Iterator<Item = &'static str> {
    COMMANDS.iter().map(|(name, _)| *name)
}

/// Parses one dot-command line such as `.repeats 10`.
pub fn parse(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    let line = line.strip_prefix('.').unwrap_or(line);
    let mut words = line.split_whitespace();
    let word = words.next().unwrap_or("");
    let (name, kind) = resolve(word)?;
    let mut int_arg = || {
        words
            .next()
            .and_then(|arg| arg.parse::<i64>().ok())
            .ok_or(CommandError::BadArgument(name))
    };
    Ok(match kind {
        Kind::List => Command::List,
        Kind::Quit => Command::Quit,
        Kind::Run => Command::Run,
        Kind::Repeats => Command::Repeats(int_arg()?),
        Kind::Seconds => Command::Seconds(int_arg()?),
        Kind::MutexCommit => Command::MutexCommit,
        Kind::Checkpoint => Command::Checkpoint(int_arg()?),
        Kind::Stop => Command::Stop,
        Kind::IntegrityCheck => Command::IntegrityCheck,
    })
}

fn resolve(word: &str) -> Result<(&'static str, Kind), CommandError> {
    if word.is_empty() {
        return Err(CommandError::Unrecognized(String::new()));
    }
    let word_lower = word.to_ascii_lowercase();
    if let Some(&(name, kind)) = COMMANDS.iter().find(|(name, _)| *name == word_lower) {
        return Ok((name, kind));
    }
    let mut matches = COMMANDS
        .iter()
        .filter(|(name, _)| name.starts_with(word_lower.as_str()));
    match (matches.next(), matches.next()) {
        (Some(&(name, kind)), None) => Ok((name, kind)),
        (Some(_), Some(_)) => Err(CommandError::Ambiguous(word.to_string())),
        (None, _) => Err(CommandError::Unrecognized(word.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn full_names_parse() {
        assert_eq!(parse(".list"), Ok(Command::List));
        assert_eq!(parse(".quit"), Ok(Command::Quit));
        assert_eq!(parse(".run"), Ok(Command::Run));
        assert_eq!(parse(".repeats 5"), Ok(Command::Repeats(5)));
        assert_eq!(parse(".seconds -1"), Ok(Command::Seconds(-1)));
        assert_eq!(parse(".mutex_commit"), Ok(Command::MutexCommit));
        assert_eq!(parse(".checkpoint 1000"), Ok(Command::Checkpoint(1000)));
        assert_eq!(parse(".stop"), Ok(Command::Stop));
        assert_eq!(parse(".integrity_check"), Ok(Command::IntegrityCheck));
    }

    #[test]
    fn unique_prefixes_resolve() {
        assert_eq!(parse(".ru"), Ok(Command::Run));
        assert_eq!(parse(".rep 3"), Ok(Command::Repeats(3)));
        assert_eq!(parse(".se 2"), Ok(Command::Seconds(2)));
        assert_eq!(parse(".st"), Ok(Command::Stop));
        assert_eq!(parse(".l"), Ok(Command::List));
        assert_eq!(parse(".i"), Ok(Command::IntegrityCheck));
        assert_eq!(parse("  .RUN  "), Ok(Command::Run));
    }

    #[test]
    fn shared_prefixes_are_ambiguous() {
        assert_eq!(parse(".r"), Err(CommandError::Ambiguous("r".into())));
        assert_eq!(parse(".s 1"), Err(CommandError::Ambiguous("s".into())));
    }

    #[test]
    fn unknown_and_malformed_commands() {
        assert_eq!(parse(".vacuum"), Err(CommandError::Unrecognized("vacuum".into())));
        assert_eq!(parse(".runner"), Err(CommandError::Unrecognized("runner".into())));
        assert_eq!(parse("."), Err(CommandError::Unrecognized(String::new())));
        assert_eq!(parse(".repeats"), Err(CommandError::BadArgument("repeats")));
        assert_eq!(parse(".seconds ten"), Err(CommandError::BadArgument("seconds")));
        assert_eq!(
            parse(".vacuum").unwrap_err().to_string(),
            "unrecognized command: .vacuum"
        );
    }

    proptest! {
        #[test]
        fn every_prefix_of_a_name_resolves_or_is_ambiguous(index in 0usize..COMMANDS.len(), len in 1usize..16) {
            let name = COMMANDS[index].0;
            let prefix = &name[..len.min(name.len())];
            let sharing = command_names().filter(|n| n.starts_with(prefix)).count();
            match resolve(prefix) {
                Ok((resolved, _)) => prop_assert!(sharing == 1 || resolved == prefix),
                Err(CommandError::Ambiguous(_)) => prop_assert!(sharing > 1),
                Err(other) => prop_assert!(false, "unexpected {other:?}"),
            }
        }
    }
}
