//! Shell-transport building blocks shared by adapters.
//!
//! Several backends only expose "run this command string" execution. To make
//! arbitrary argv, environment values, and multi-byte payloads survive that
//! transport, commands are wrapped in a base64 envelope and decoded inside
//! the sandbox. The same trick carries file contents for adapters without a
//! native file API.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;

use crate::capability::{Code, Fs, Process};
use crate::error::{DriverResult, SandboxError};
use crate::types::{
    FsEntry, FsEntryKind, Language, RunCodeInput, RunCommand, RunResult,
};

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn b64_decode(text: &str) -> DriverResult<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| SandboxError::provider(format!("invalid base64 payload: {e}")))
}

/// Render a [`RunCommand`] as a plain shell script: env exports, working
/// directory, then the quoted argv.
pub fn render_script(cmd: &RunCommand) -> String {
    let mut script = String::new();
    for (key, value) in &cmd.env {
        script.push_str(&format!("export {}={}\n", key, shell_words::quote(value)));
    }
    if let Some(cwd) = &cmd.cwd {
        script.push_str(&format!("cd {} || exit 1\n", shell_words::quote(cwd)));
    }
    let argv = std::iter::once(cmd.cmd.as_str())
        .chain(cmd.args.iter().map(String::as_str))
        .map(|a| shell_words::quote(a).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    script.push_str(&argv);
    script
}

/// Encode a [`RunCommand`] into a single command string safe to hand to any
/// "exec one string" API: `echo {b64} | base64 -d | sh`.
pub fn encode_command(cmd: &RunCommand) -> String {
    format!("echo {} | base64 -d | sh", b64(render_script(cmd).as_bytes()))
}

/// Build the command that executes a code snippet via the language's
/// one-liner entry point. The snippet travels base64-encoded so quoting and
/// multi-byte input survive the shell.
pub fn code_command(input: &RunCodeInput) -> RunCommand {
    let encoded = b64(input.code.as_bytes());
    let line = match input.language {
        Language::Python => {
            format!("python3 -u -c \"$(echo {encoded} | base64 -d)\"")
        }
        Language::Javascript => {
            format!("node -e \"$(echo {encoded} | base64 -d)\"")
        }
        Language::Typescript => {
            // tsx wants a file on disk.
            format!(
                "echo {encoded} | base64 -d > /tmp/.run_code.ts && npx tsx /tmp/.run_code.ts"
            )
        }
        Language::Bash => format!("echo {encoded} | base64 -d | sh"),
    };
    let mut cmd = RunCommand::new("sh").arg("-c").arg(line);
    cmd.timeout_ms = input.timeout_ms;
    cmd
}

/// Parse one `ls -la` line into an entry. Returns `None` for the `total`
/// header, `.`/`..`, and anything unrecognizable.
pub fn parse_ls_line(line: &str, base: &str) -> Option<FsEntry> {
    let line = line.trim_end();
    if line.is_empty() || line.starts_with("total") {
        return None;
    }
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 9 {
        return None;
    }
    let name = fields[8..].join(" ");
    if name == "." || name == ".." {
        return None;
    }
    // Symlink lines read `name -> target`.
    let name = name.split(" -> ").next().unwrap_or(&name).to_string();
    let kind = match line.chars().next() {
        Some('d') => FsEntryKind::Dir,
        _ => FsEntryKind::File,
    };
    let size = fields[4].parse::<u64>().ok();
    let path = if name.starts_with('/') {
        name
    } else if base.ends_with('/') {
        format!("{base}{name}")
    } else {
        format!("{base}/{name}")
    };
    Some(FsEntry {
        path,
        kind,
        size,
        modified_at: None,
    })
}

async fn run_checked(
    process: &Arc<dyn Process>,
    id: &str,
    cmd: RunCommand,
    what: &str,
) -> DriverResult<RunResult> {
    let result = process.run(id, cmd).await?;
    if result.exit_code != 0 {
        let detail = if result.stderr.trim().is_empty() {
            result.stdout.trim().to_string()
        } else {
            result.stderr.trim().to_string()
        };
        let kind = crate::error::classify_message(None, &detail);
        return Err(SandboxError::new(kind, format!("{what} failed: {detail}"))
            .with_operation(what.to_string())
            .with_sandbox(id));
    }
    Ok(result)
}

/// Filesystem capability layered on top of command execution.
///
/// Used by adapters whose backend has no file API: contents cross the shell
/// base64-encoded for binary safety, directory listings come from `ls -la`.
pub struct ShellFs {
    process: Arc<dyn Process>,
}

impl ShellFs {
    pub fn new(process: Arc<dyn Process>) -> Self {
        Self { process }
    }
}

#[async_trait]
impl Fs for ShellFs {
    async fn read_file(&self, id: &str, path: &str) -> DriverResult<Bytes> {
        let cmd = RunCommand::new("sh")
            .arg("-c")
            .arg(format!("base64 {}", shell_words::quote(path)));
        let result = run_checked(&self.process, id, cmd, "read_file").await?;
        Ok(Bytes::from(b64_decode(&result.stdout)?))
    }

    async fn write_file(
        &self,
        id: &str,
        path: &str,
        data: Bytes,
        mode: Option<u32>,
    ) -> DriverResult<()> {
        let quoted = shell_words::quote(path).into_owned();
        let parent = std::path::Path::new(path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty() && p != "/");
        let mut line = String::new();
        if let Some(parent) = parent {
            line.push_str(&format!("mkdir -p {} && ", shell_words::quote(&parent)));
        }
        line.push_str(&format!("echo {} | base64 -d > {}", b64(&data), quoted));
        if let Some(mode) = mode {
            line.push_str(&format!(" && chmod {mode:o} {quoted}"));
        }
        let cmd = RunCommand::new("sh").arg("-c").arg(line);
        run_checked(&self.process, id, cmd, "write_file").await?;
        Ok(())
    }

    async fn list_dir(&self, id: &str, path: &str, recursive: bool) -> DriverResult<Vec<FsEntry>> {
        let quoted = shell_words::quote(path).into_owned();
        let line = if recursive {
            // `ls -ld` prints the full path in the name field.
            format!("find {quoted} -mindepth 1 -exec ls -ld {{}} +")
        } else {
            format!("ls -la {quoted}")
        };
        let cmd = RunCommand::new("sh").arg("-c").arg(line);
        let result = run_checked(&self.process, id, cmd, "list_dir").await?;
        Ok(result
            .stdout
            .lines()
            .filter_map(|line| parse_ls_line(line, path))
            .collect())
    }

    async fn mkdir(&self, id: &str, path: &str) -> DriverResult<()> {
        let cmd = RunCommand::new("mkdir").arg("-p").arg(path);
        run_checked(&self.process, id, cmd, "mkdir").await?;
        Ok(())
    }

    async fn rm(&self, id: &str, path: &str, recursive: bool, force: bool) -> DriverResult<()> {
        let mut cmd = RunCommand::new("rm");
        if recursive {
            cmd = cmd.arg("-r");
        }
        if force {
            cmd = cmd.arg("-f");
        }
        cmd = cmd.arg(path);
        run_checked(&self.process, id, cmd, "rm").await?;
        Ok(())
    }
}

/// Code capability layered on top of command execution.
pub struct ShellCode {
    process: Arc<dyn Process>,
}

impl ShellCode {
    pub fn new(process: Arc<dyn Process>) -> Self {
        Self { process }
    }
}

#[async_trait]
impl Code for ShellCode {
    async fn run_code(&self, id: &str, input: RunCodeInput) -> DriverResult<RunResult> {
        self.process.run(id, code_command(&input)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkStream;

    #[test]
    fn render_script_quotes_and_exports() {
        let cmd = RunCommand::new("printenv")
            .arg("GREETING")
            .env("GREETING", "hello world")
            .cwd("/work dir");
        let script = render_script(&cmd);
        assert!(script.contains("export GREETING='hello world'"));
        assert!(script.contains("cd '/work dir' || exit 1"));
        assert!(script.ends_with("printenv GREETING"));
    }

    #[test]
    fn encode_command_round_trips_through_base64() {
        let cmd = RunCommand::new("echo").arg("it's a \"test\"");
        let encoded = encode_command(&cmd);
        assert!(encoded.starts_with("echo "));
        assert!(encoded.ends_with(" | base64 -d | sh"));

        let b64_part = encoded
            .strip_prefix("echo ")
            .and_then(|s| s.strip_suffix(" | base64 -d | sh"))
            .unwrap();
        let decoded = String::from_utf8(b64_decode(b64_part).unwrap()).unwrap();
        assert_eq!(decoded, render_script(&cmd));
    }

    #[test]
    fn code_commands_per_language() {
        let python = code_command(&RunCodeInput {
            language: Language::Python,
            code: "print('hi')".into(),
            timeout_ms: Some(1000),
        });
        assert_eq!(python.cmd, "sh");
        assert!(python.args[1].contains("python3 -u -c"));
        assert_eq!(python.timeout_ms, Some(1000));

        let ts = code_command(&RunCodeInput {
            language: Language::Typescript,
            code: "console.log(1)".into(),
            timeout_ms: None,
        });
        assert!(ts.args[1].contains("npx tsx"));

        let bash = code_command(&RunCodeInput {
            language: Language::Bash,
            code: "echo hi".into(),
            timeout_ms: None,
        });
        assert!(bash.args[1].ends_with("| base64 -d | sh"));
    }

    #[test]
    fn ls_parsing_skips_total_and_dot_entries() {
        let listing = "\
total 12
drwxr-xr-x    2 root     root          4096 Jan  1 00:00 .
drwxr-xr-x    3 root     root          4096 Jan  1 00:00 ..
-rw-r--r--    1 root     root            11 Jan  1 00:00 hello.txt
drwxr-xr-x    2 root     root          4096 Jan  1 00:00 sub dir
lrwxrwxrwx    1 root     root             9 Jan  1 00:00 link -> hello.txt";

        let entries: Vec<FsEntry> = listing
            .lines()
            .filter_map(|l| parse_ls_line(l, "/data"))
            .collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path, "/data/hello.txt");
        assert_eq!(entries[0].kind, FsEntryKind::File);
        assert_eq!(entries[0].size, Some(11));
        assert_eq!(entries[1].path, "/data/sub dir");
        assert_eq!(entries[1].kind, FsEntryKind::Dir);
        assert_eq!(entries[2].path, "/data/link");
    }

    #[test]
    fn single_file_listing_yields_one_file_entry() {
        let listing = "\
total 4
drwxr-xr-x    2 root     root          4096 Jan  1 00:00 .
drwxr-xr-x    3 root     root          4096 Jan  1 00:00 ..
-rw-r--r--    1 root     root             5 Jan  1 00:00 only.bin";
        let entries: Vec<FsEntry> = listing
            .lines()
            .filter_map(|l| parse_ls_line(l, "/tmp/dir"))
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, FsEntryKind::File);
        assert!(entries[0].path.ends_with("only.bin"));
    }

    // Fake process that records commands and replays canned results; used to
    // exercise the shell-layered Fs without a sandbox.
    struct ScriptedProcess {
        replies: tokio::sync::Mutex<Vec<RunResult>>,
        seen: tokio::sync::Mutex<Vec<RunCommand>>,
    }

    #[async_trait]
    impl Process for ScriptedProcess {
        async fn run(&self, _id: &str, cmd: RunCommand) -> DriverResult<RunResult> {
            self.seen.lock().await.push(cmd);
            Ok(self.replies.lock().await.remove(0))
        }

        async fn stream(&self, _id: &str, _cmd: RunCommand) -> DriverResult<ChunkStream> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    #[tokio::test]
    async fn shell_fs_read_decodes_base64() {
        let process = Arc::new(ScriptedProcess {
            replies: tokio::sync::Mutex::new(vec![RunResult {
                exit_code: 0,
                stdout: b64(b"Hello").to_string() + "\n",
                stderr: String::new(),
            }]),
            seen: tokio::sync::Mutex::new(vec![]),
        });
        let fs = ShellFs::new(process.clone() as Arc<dyn Process>);
        let bytes = fs.read_file("sbx", "/tmp/b.bin").await.unwrap();
        assert_eq!(&bytes[..], b"Hello");

        let seen = process.seen.lock().await;
        assert!(seen[0].args[1].contains("base64 /tmp/b.bin"));
    }

    #[tokio::test]
    async fn shell_fs_write_creates_parent_and_chmods() {
        let process = Arc::new(ScriptedProcess {
            replies: tokio::sync::Mutex::new(vec![RunResult {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            }]),
            seen: tokio::sync::Mutex::new(vec![]),
        });
        let fs = ShellFs::new(process.clone() as Arc<dyn Process>);
        fs.write_file("sbx", "/a/b/c.bin", Bytes::from_static(b"\x00\x01"), Some(0o755))
            .await
            .unwrap();

        let seen = process.seen.lock().await;
        let line = &seen[0].args[1];
        assert!(line.contains("mkdir -p /a/b"));
        assert!(line.contains("| base64 -d > /a/b/c.bin"));
        assert!(line.contains("chmod 755 /a/b/c.bin"));
    }

    #[tokio::test]
    async fn shell_fs_surfaces_nonzero_exit() {
        let process = Arc::new(ScriptedProcess {
            replies: tokio::sync::Mutex::new(vec![RunResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: "cat: /nope: No such file or directory".into(),
            }]),
            seen: tokio::sync::Mutex::new(vec![]),
        });
        let fs = ShellFs::new(process as Arc<dyn Process>);
        let err = fs.read_file("sbx", "/nope").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }
}
