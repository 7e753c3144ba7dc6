//! The [`Command`] value: a program and its argument vector.

use std::{borrow::Cow, fmt, time::Duration};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("empty command provided")]
    Empty,
}

pub type Result<T> = std::result::Result<T, Error>;

/// A program invocation. Arguments are stored unquoted; quoting only happens when the command is
/// rendered as a shell line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    program: String,
    args: Vec<String>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    /// Builds a command from a string, separating args with whitespaces. No shell parsing is
    /// done, use [`Command::script`] for anything needing quotes, pipes or redirections.
    pub fn by_str(line: &str) -> Result<Self> {
        let mut iter = line.split_ascii_whitespace();
        let program = iter.next().ok_or(Error::Empty)?;
        Ok(Self::new(program).args(iter))
    }

    /// A shell script run through `sh -c`.
    pub fn script(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Appends `arg` only when it is `Some`.
    pub fn arg_opt(self, flag: &str, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.arg(flag).arg(value.to_string()),
            None => self,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// The full argument vector, program first.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone()).chain(self.args.iter().cloned()).collect()
    }

    /// Wraps this command so that it runs as an argument of `wrapper`, e.g. `timeout 5 <self>`.
    pub fn wrapped_by(self, wrapper: Self) -> Self {
        let argv = self.argv();
        wrapper.args(argv)
    }

    /// Prefixes the command with `timeout <secs>` when a timeout is provided. The remote `timeout`
    /// binary only accepts whole seconds here, sub-second values are rounded up.
    pub fn with_timeout(self, timeout: Option<Duration>) -> Self {
        match timeout {
            Some(timeout) => {
                let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
                self.wrapped_by(Self::new("timeout").arg(secs.to_string()))
            }
            None => self,
        }
    }

    /// Renders the command as a single shell line with every argument quoted as needed.
    pub fn to_line(&self) -> String {
        let mut line = quote(&self.program).into_owned();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&quote(arg));
        }
        line
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// Quotes `arg` for a POSIX shell. Arguments made only of safe characters are returned as-is.
pub fn quote(arg: &str) -> Cow<'_, str> {
    let safe = |c: char| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c);

    if !arg.is_empty() && arg.chars().all(safe) {
        return Cow::Borrowed(arg);
    }

    Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
}
