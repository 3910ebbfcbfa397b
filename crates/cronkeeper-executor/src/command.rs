//! Turning a `task_exec` string into something we can spawn.
//!
//! Script invocations (`python3 job.py --flag`, `./cleanup.sh`) run without a
//! shell so signals reach the interpreter directly and arguments are not
//! re-quoted. Anything else is handed to the platform shell verbatim.

use std::collections::BTreeMap;
use std::process::Stdio;

use tokio::process::Command;

/// Interpreters recognised as the first word of `task_exec`.
const INTERPRETERS: &[&str] = &[
    "python", "python3", "node", "bash", "sh", "ruby", "perl", "php",
];

/// Script extension → interpreter used when the script is invoked bare.
const SCRIPT_EXTENSIONS: &[(&str, &str)] = &[
    (".py", "python3"),
    (".sh", "sh"),
    (".js", "node"),
    (".rb", "ruby"),
    (".pl", "perl"),
    (".php", "php"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    /// Interpreter plus arguments, spawned without a shell.
    Direct { program: String, args: Vec<String> },
    /// Full command line for `sh -c`.
    Shell(String),
}

impl CommandSpec {
    pub fn parse(task_exec: &str) -> Self {
        let line = task_exec.trim();
        let words: Vec<&str> = line.split_whitespace().collect();

        match words.as_slice() {
            [interpreter, script, rest @ ..]
                if INTERPRETERS.contains(interpreter) && script_interpreter(script).is_some() =>
            {
                let mut args = vec![script.to_string()];
                args.extend(rest.iter().map(|s| s.to_string()));
                CommandSpec::Direct {
                    program: interpreter.to_string(),
                    args,
                }
            }
            [script] => match script_interpreter(script) {
                Some(interpreter) => CommandSpec::Direct {
                    program: interpreter.to_string(),
                    args: vec![script.to_string()],
                },
                None => CommandSpec::Shell(line.to_string()),
            },
            _ => CommandSpec::Shell(line.to_string()),
        }
    }

    /// Build a tokio `Command` with a replaced environment, piped output and
    /// (on Unix) a dedicated process group so the whole tree can be signalled.
    pub fn to_command(&self, env: &BTreeMap<String, String>) -> Command {
        let mut cmd = match self {
            CommandSpec::Direct { program, args } => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
            CommandSpec::Shell(line) => shell_command(line),
        };

        cmd.env_clear()
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

fn script_interpreter(word: &str) -> Option<&'static str> {
    SCRIPT_EXTENSIONS
        .iter()
        .find(|(ext, _)| word.len() > ext.len() && word.ends_with(ext))
        .map(|(_, interpreter)| *interpreter)
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(line);
    cmd
}

#[cfg(not(unix))]
fn shell_command(line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(line);
    cmd
}
