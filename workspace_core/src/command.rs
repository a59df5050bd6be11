//! Turns a caller's command into the program and argument vector that is actually executed.
//!
//! Two input forms exist:
//!
//! - [`CommandSpec::Shell`]: one string with shell syntax. It is wrapped in the host's
//!   default shell (`/bin/sh -c` or `cmd.exe /S /C`) so pipes, redirection and quoting
//!   behave the way they do in a terminal.
//! - [`CommandSpec::Direct`]: an executable and its arguments. Nothing is parsed or
//!   quoted by a shell, so this is the form to use for untrusted arguments.
//!
//! On Windows a shell string that already starts with a shell (`powershell ...`,
//! `wsl ...`, `cmd /c ...`) is not wrapped a second time. POSIX text is always
//! handed to `/bin/sh -c`, even when it starts with `bash`, so operators after the
//! leading command keep their meaning.

use crate::error::{Result, WorkspaceError};

/// POSIX shell used for shell-mode commands.
pub const POSIX_SHELL: &str = "/bin/sh";

/// Windows shell used for shell-mode commands.
pub const WINDOWS_SHELL: &str = "cmd.exe";

/// Leading tokens that already name a shell or shell-like interpreter.
const SHELL_LAUNCHERS: &[&str] = &[
    "cmd", "powershell", "pwsh", "wsl", "bash", "sh", "zsh", "dash", "ksh", "fish",
];

/// `cmd.exe` built-ins that have no executable of their own.
const WINDOWS_BUILTINS: &[&str] = &[
    "echo", "dir", "del", "copy", "move", "mkdir", "rmdir", "type", "cls", "ver", "set", "ren",
];

/// Caller-supplied command, before platform translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    Shell(String),
    Direct { program: String, args: Vec<String> },
}

impl CommandSpec {
    pub fn shell(text: impl Into<String>) -> Self {
        CommandSpec::Shell(text.into())
    }

    pub fn direct<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::Direct {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse text into a direct invocation with the quote-aware tokenizer (no shell involved).
    pub fn parse_direct(text: &str) -> Result<Self> {
        let mut parts = split_command_line(text).into_iter();
        let program = parts.next().ok_or(WorkspaceError::EmptyCommand)?;
        Ok(CommandSpec::Direct {
            program,
            args: parts.collect(),
        })
    }

    /// Text inspected by the security guard. Direct invocations are joined with spaces.
    pub fn inspection_text(&self) -> String {
        match self {
            CommandSpec::Shell(text) => text.clone(),
            CommandSpec::Direct { program, args } => std::iter::once(program.as_str())
                .chain(args.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// Which shell conventions to build for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellFlavor {
    Posix,
    Windows,
}

impl ShellFlavor {
    pub fn host() -> Self {
        if cfg!(windows) {
            ShellFlavor::Windows
        } else {
            ShellFlavor::Posix
        }
    }
}

/// Program plus arguments, ready for the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Arguments are already quoted for a Windows command line and must be joined verbatim.
    pub verbatim: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            verbatim: false,
        }
    }

    /// `program` followed by `args`.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Single command line as `CreateProcessW` expects it.
    pub fn windows_command_line(&self) -> String {
        let mut line = quote_windows_arg(&self.program);
        for arg in &self.args {
            line.push(' ');
            if self.verbatim {
                line.push_str(arg);
            } else {
                line.push_str(&quote_windows_arg(arg));
            }
        }
        line
    }
}

/// Builds [`Invocation`]s for one shell flavor.
#[derive(Debug, Clone, Copy)]
pub struct CommandBuilder {
    flavor: ShellFlavor,
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new(ShellFlavor::host())
    }
}

impl CommandBuilder {
    pub fn new(flavor: ShellFlavor) -> Self {
        Self { flavor }
    }

    pub fn flavor(&self) -> ShellFlavor {
        self.flavor
    }

    pub fn build(&self, spec: &CommandSpec) -> Result<Invocation> {
        match spec {
            CommandSpec::Shell(text) => self.build_shell(text),
            CommandSpec::Direct { program, args } => self.build_direct(program, args),
        }
    }

    fn build_shell(&self, text: &str) -> Result<Invocation> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(WorkspaceError::EmptyCommand);
        }

        // `/bin/sh -c` already runs a leading `bash` or `sh` correctly, operators
        // included; only the Windows flavor passes a leading shell through.
        if self.flavor == ShellFlavor::Windows && starts_with_shell(trimmed) {
            let program = first_token(trimmed).ok_or(WorkspaceError::EmptyCommand)?;
            // Backslashes are path separators here; keep the tail exactly as written.
            let rest = trimmed[trimmed.find(program).unwrap_or(0) + program.len()..]
                .trim_start_matches(['"', '\''])
                .trim();
            return Ok(Invocation {
                program: program.to_string(),
                args: if rest.is_empty() {
                    Vec::new()
                } else {
                    vec![rest.to_string()]
                },
                verbatim: true,
            });
        }

        Ok(match self.flavor {
            ShellFlavor::Posix => {
                Invocation::new(POSIX_SHELL, vec!["-c".to_string(), trimmed.to_string()])
            }
            ShellFlavor::Windows => Invocation {
                program: WINDOWS_SHELL.to_string(),
                args: vec![
                    "/S".to_string(),
                    "/C".to_string(),
                    format!("\"{trimmed}\""),
                ],
                verbatim: true,
            },
        })
    }

    fn build_direct(&self, program: &str, args: &[String]) -> Result<Invocation> {
        if program.trim().is_empty() {
            return Err(WorkspaceError::EmptyCommand);
        }

        if self.flavor == ShellFlavor::Windows && needs_cmd_wrapper(program) {
            let mut wrapped = Vec::with_capacity(args.len() + 2);
            wrapped.push("/c".to_string());
            wrapped.push(program.to_string());
            wrapped.extend(args.iter().cloned());
            return Ok(Invocation::new(WINDOWS_SHELL, wrapped));
        }

        Ok(Invocation::new(program, args.to_vec()))
    }
}

/// Lower-cased file name of `token` without directory or `.exe` suffix.
pub(crate) fn normalized_program_name(token: &str) -> String {
    let name = token
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(token)
        .to_ascii_lowercase();
    name.strip_suffix(".exe").map(str::to_string).unwrap_or(name)
}

/// First whitespace-separated word with surrounding quotes removed.
///
/// Unlike [`split_command_line`] this keeps backslashes, so Windows paths survive.
pub(crate) fn first_token(text: &str) -> Option<&str> {
    let text = text.trim_start();
    let token = match text.chars().next()? {
        quote @ ('"' | '\'') => {
            let body = &text[1..];
            body.split(quote).next().unwrap_or(body)
        }
        _ => text.split_whitespace().next()?,
    };
    Some(token).filter(|token| !token.is_empty())
}

fn starts_with_shell(text: &str) -> bool {
    first_token(text)
        .is_some_and(|first| SHELL_LAUNCHERS.contains(&normalized_program_name(first).as_str()))
}

fn needs_cmd_wrapper(program: &str) -> bool {
    let lower = program.to_ascii_lowercase();
    WINDOWS_BUILTINS.contains(&lower.as_str()) || lower.ends_with(".bat") || lower.ends_with(".cmd")
}

/// Split a command line into words.
///
/// Whitespace separates words outside quotes. Single quotes are literal, double quotes
/// group but still honour backslash escapes, and a backslash outside single quotes
/// escapes the next character.
pub fn split_command_line(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut has_word = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut escape = false;

    for c in text.chars() {
        if escape {
            current.push(c);
            escape = false;
            continue;
        }
        match c {
            '\\' if !in_single => {
                escape = true;
                has_word = true;
            }
            '\'' if !in_double => {
                in_single = !in_single;
                has_word = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                has_word = true;
            }
            ' ' | '\t' | '\n' if !in_single && !in_double => {
                if has_word {
                    parts.push(std::mem::take(&mut current));
                    has_word = false;
                }
            }
            _ => {
                current.push(c);
                has_word = true;
            }
        }
    }
    if has_word {
        parts.push(current);
    }
    parts
}

/// Quote one argument following the MSVC runtime parsing rules.
pub fn quote_windows_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '\n', '"']) {
        return arg.to_string();
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    let mut backslashes = 0usize;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                quoted.extend(std::iter::repeat_n('\\', backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
            }
            _ => {
                quoted.extend(std::iter::repeat_n('\\', backslashes));
                quoted.push(c);
                backslashes = 0;
            }
        }
    }
    quoted.extend(std::iter::repeat_n('\\', backslashes * 2));
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posix_shell_mode_wraps_in_sh() {
        let inv = CommandBuilder::new(ShellFlavor::Posix)
            .build(&CommandSpec::shell("echo hi | wc -c"))
            .unwrap();
        assert_eq!(inv.argv(), vec!["/bin/sh", "-c", "echo hi | wc -c"]);
    }

    #[test]
    fn windows_shell_mode_wraps_in_cmd() {
        let inv = CommandBuilder::new(ShellFlavor::Windows)
            .build(&CommandSpec::shell("dir /b"))
            .unwrap();
        assert_eq!(inv.program, "cmd.exe");
        assert_eq!(inv.args, vec!["/S", "/C", "\"dir /b\""]);
        assert_eq!(inv.windows_command_line(), "cmd.exe /S /C \"dir /b\"");
    }

    #[test]
    fn explicit_shells_are_not_double_wrapped() {
        let builder = CommandBuilder::new(ShellFlavor::Windows);
        let inv = builder
            .build(&CommandSpec::shell("PowerShell.EXE -Command Get-Date"))
            .unwrap();
        assert_eq!(inv.program, "PowerShell.EXE");
        assert_eq!(inv.args, vec!["-Command Get-Date"]);
        assert_eq!(
            inv.windows_command_line(),
            "PowerShell.EXE -Command Get-Date"
        );

        let inv = builder
            .build(&CommandSpec::shell(r"C:\Windows\System32\cmd.exe /c dir C:\"))
            .unwrap();
        assert_eq!(inv.program, r"C:\Windows\System32\cmd.exe");
        assert_eq!(inv.args, vec![r"/c dir C:\"]);

        let inv = builder.build(&CommandSpec::shell("WSL")).unwrap();
        assert_eq!(inv.program, "WSL");
        assert!(inv.args.is_empty());

    }

    #[test]
    fn posix_text_starting_with_a_shell_is_still_wrapped() {
        let text = "sh -c 'echo one' && echo two > out.txt";
        let inv = CommandBuilder::new(ShellFlavor::Posix)
            .build(&CommandSpec::shell(text))
            .unwrap();
        assert_eq!(inv.argv(), vec!["/bin/sh", "-c", text]);
    }

    #[test]
    fn empty_commands_are_rejected() {
        let builder = CommandBuilder::default();
        assert!(matches!(
            builder.build(&CommandSpec::shell("   \t")),
            Err(WorkspaceError::EmptyCommand)
        ));
        assert!(matches!(
            builder.build(&CommandSpec::direct("", Vec::<String>::new())),
            Err(WorkspaceError::EmptyCommand)
        ));
        assert!(matches!(
            CommandSpec::parse_direct(""),
            Err(WorkspaceError::EmptyCommand)
        ));
    }

    #[test]
    fn direct_mode_passes_arguments_untouched() {
        let inv = CommandBuilder::new(ShellFlavor::Posix)
            .build(&CommandSpec::direct("printf", ["%s;rm -rf /", "$HOME"]))
            .unwrap();
        assert_eq!(inv.argv(), vec!["printf", "%s;rm -rf /", "$HOME"]);
    }

    #[test]
    fn windows_builtins_route_through_cmd() {
        let inv = CommandBuilder::new(ShellFlavor::Windows)
            .build(&CommandSpec::direct("echo", ["hello"]))
            .unwrap();
        assert_eq!(inv.argv(), vec!["cmd.exe", "/c", "echo", "hello"]);

        let inv = CommandBuilder::new(ShellFlavor::Windows)
            .build(&CommandSpec::direct("build.BAT", Vec::<String>::new()))
            .unwrap();
        assert_eq!(inv.program, "cmd.exe");
    }

    #[test]
    fn tokenizer_handles_quotes_and_escapes() {
        assert_eq!(
            split_command_line(r#"git commit -m "fix: a \"b\"" 'c d' e\ f"#),
            vec!["git", "commit", "-m", r#"fix: a "b""#, "c d", "e f"]
        );
        assert_eq!(split_command_line("a ''"), vec!["a", ""]);
        assert!(split_command_line("   ").is_empty());
    }

    #[test]
    fn windows_quoting_follows_msvc_rules() {
        assert_eq!(quote_windows_arg("plain"), "plain");
        assert_eq!(quote_windows_arg(""), "\"\"");
        assert_eq!(quote_windows_arg("a b"), "\"a b\"");
        assert_eq!(quote_windows_arg(r#"say "hi""#), r#""say \"hi\"""#);
        assert_eq!(quote_windows_arg(r"C:\dir with space\"), r#""C:\dir with space\\""#);
    }

    #[test]
    fn program_names_are_normalized() {
        assert_eq!(normalized_program_name("/usr/bin/CURL"), "curl");
        assert_eq!(normalized_program_name(r"C:\Windows\cmd.exe"), "cmd");
    }

    #[test]
    fn first_token_keeps_backslashes_and_strips_quotes() {
        assert_eq!(first_token(r"C:\bin\curl.exe -I x"), Some(r"C:\bin\curl.exe"));
        assert_eq!(
            first_token(r#""C:\Program Files\pwsh.exe" -c x"#),
            Some(r"C:\Program Files\pwsh.exe")
        );
        assert_eq!(first_token("   "), None);
    }
}
