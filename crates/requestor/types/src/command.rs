//! Commands and scripts executed against an activity

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Shell used by [`Command::shell`]
pub const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Whitespace in entry point '{0}' is forbidden")]
    WhitespaceInEntryPoint(String),

    #[error("Run command needs an entry point")]
    EmptyCommand,

    #[error("Script has no commands")]
    EmptyScript,
}

/// A single exe-unit command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Deploy {
        #[serde(default)]
        args: Option<Value>,
    },
    Start {
        #[serde(default)]
        args: Vec<String>,
    },
    Run {
        entry_point: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Upload a file published at `from` into the container at `to`
    SendFile { from: String, to: String },
    /// Download a container file at `from` to the location published at `to`
    DownloadFile { from: String, to: String },
}

impl Command {
    pub fn deploy() -> Self {
        Command::Deploy { args: None }
    }

    pub fn deploy_with(args: Value) -> Self {
        Command::Deploy { args: Some(args) }
    }

    pub fn start() -> Self {
        Command::Start { args: Vec::new() }
    }

    /// Run `argv[0]` with the remaining elements as arguments.
    pub fn run<I, S>(argv: I) -> Result<Self, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let entry_point = argv.next().ok_or(CommandError::EmptyCommand)?;
        if entry_point.trim().is_empty() {
            return Err(CommandError::EmptyCommand);
        }
        if entry_point.split_whitespace().count() > 1 {
            return Err(CommandError::WhitespaceInEntryPoint(entry_point));
        }
        Ok(Command::Run {
            entry_point,
            args: argv.collect(),
        })
    }

    /// Run `cmd` through `/bin/sh -c`.
    pub fn shell(cmd: impl Into<String>) -> Self {
        Command::Run {
            entry_point: DEFAULT_SHELL.to_string(),
            args: vec!["-c".to_string(), cmd.into()],
        }
    }

    pub fn send_file(from: impl Into<String>, to: impl Into<String>) -> Self {
        Command::SendFile {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn download_file(from: impl Into<String>, to: impl Into<String>) -> Self {
        Command::DownloadFile {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Name used in the exe script
    pub fn name(&self) -> &'static str {
        match self {
            Command::Deploy { .. } => "deploy",
            Command::Start { .. } => "start",
            Command::Run { .. } => "run",
            Command::SendFile { .. } | Command::DownloadFile { .. } => "transfer",
        }
    }

    /// Exe-script representation of this command
    pub fn to_exe_script(&self) -> Value {
        let args = match self {
            Command::Deploy { args } => args.clone().unwrap_or_else(|| json!({})),
            Command::Start { args } if args.is_empty() => json!({}),
            Command::Start { args } => json!({ "args": args }),
            Command::Run { entry_point, args } => json!({
                "entry_point": entry_point,
                "args": args,
                "capture": {
                    "stdout": { "atEnd": { "format": "string" } },
                    "stderr": { "atEnd": { "format": "string" } },
                },
            }),
            Command::SendFile { from, to } => json!({
                "from": from,
                "to": format!("container:{}", to),
            }),
            Command::DownloadFile { from, to } => json!({
                "from": format!("container:{}", from),
                "to": to,
            }),
        };
        json!({ self.name(): args })
    }
}

/// Ordered, append-only list of commands submitted as one batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Script {
    commands: Vec<Command>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command and return its index in the script.
    pub fn add(&mut self, command: Command) -> usize {
        self.commands.push(command);
        self.commands.len() - 1
    }

    pub fn with(mut self, command: Command) -> Self {
        self.add(command);
        self
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn validate(&self) -> Result<(), CommandError> {
        if self.commands.is_empty() {
            return Err(CommandError::EmptyScript);
        }
        Ok(())
    }

    /// Exe-script JSON array, one entry per command
    pub fn to_exe_script(&self) -> Value {
        Value::Array(self.commands.iter().map(Command::to_exe_script).collect())
    }
}

impl FromIterator<Command> for Script {
    fn from_iter<T: IntoIterator<Item = Command>>(iter: T) -> Self {
        Self {
            commands: iter.into_iter().collect(),
        }
    }
}

/// `Deploy` followed by `Start`, the preparation every activity needs
pub fn prepare_script(deploy_args: Option<Value>) -> Script {
    Script::new()
        .with(Command::Deploy { args: deploy_args })
        .with(Command::start())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_run_rejects_whitespace_entry_point() {
        let err = Command::run(["echo foo", "bar"]).unwrap_err();
        assert_eq!(err, CommandError::WhitespaceInEntryPoint("echo foo".into()));
        assert_eq!(
            Command::run(Vec::<String>::new()).unwrap_err(),
            CommandError::EmptyCommand
        );
    }

    #[test]
    fn test_run_splits_entry_point() {
        let cmd = Command::run(["/bin/echo", "foo", ">", "/x"]).unwrap();
        assert_eq!(
            cmd,
            Command::Run {
                entry_point: "/bin/echo".into(),
                args: vec!["foo".into(), ">".into(), "/x".into()],
            }
        );
    }

    #[test]
    fn test_exe_script_shapes() {
        let script = prepare_script(None)
            .with(Command::shell("echo foo > /golem/output/x"))
            .with(Command::send_file("gftp://local/in.txt", "/golem/input/in.txt"))
            .with(Command::download_file("/golem/output/x", "gftp://local/x"));

        let json = script.to_exe_script();
        assert_eq!(json[0], json!({"deploy": {}}));
        assert_eq!(json[1], json!({"start": {}}));
        assert_eq!(json[2]["run"]["entry_point"], "/bin/sh");
        assert_eq!(json[2]["run"]["args"][0], "-c");
        assert_eq!(json[3]["transfer"]["to"], "container:/golem/input/in.txt");
        assert_eq!(json[4]["transfer"]["from"], "container:/golem/output/x");
    }

    #[test]
    fn test_script_indexes_are_append_order() {
        let mut script = Script::new();
        assert!(script.validate().is_err());
        assert_eq!(script.add(Command::deploy()), 0);
        assert_eq!(script.add(Command::start()), 1);
        assert_eq!(script.len(), 2);
        assert!(script.validate().is_ok());
    }

    proptest! {
        #[test]
        fn shell_wraps_any_command_verbatim(cmd in ".*") {
            match Command::shell(cmd.clone()) {
                Command::Run { entry_point, args } => {
                    prop_assert_eq!(entry_point, DEFAULT_SHELL);
                    prop_assert_eq!(args, vec!["-c".to_string(), cmd]);
                }
                other => prop_assert!(false, "unexpected command {:?}", other),
            }
        }
    }
}
