//! Small process-related helpers shared across the workspace.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Split a command line into program and arguments.
///
/// Tokens are separated by ASCII whitespace. Double quotes group a token that
/// contains whitespace; the quotes themselves are removed. Returns `None` when
/// the line holds no program.
pub fn split_command_line(line: &str) -> Option<(String, Vec<String>)> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in line.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_ascii_whitespace() && !in_quotes => {
                if has_token {
                    tokens.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        tokens.push(current);
    }

    let mut tokens = tokens.into_iter();
    let program = tokens.next()?;
    Some((program, tokens.collect()))
}

/// Terminate a child process, giving it `grace` to exit on its own first.
///
/// Callers are expected to have closed the child's stdin already so that
/// tools like ffmpeg can flush their output. If the child is still running
/// after the grace period it is killed. Returns the exit code, if any.
#[cfg(feature = "tokio")]
pub async fn terminate_child(
    child: &mut tokio::process::Child,
    grace: std::time::Duration,
) -> std::io::Result<Option<i32>> {
    if let Some(status) = child.try_wait()? {
        return Ok(status.code());
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Ok(status?.code()),
        Err(_) => {
            tracing::warn!(
                pid = child.id(),
                "Process did not exit within {:?}; killing",
                grace
            );
            child.kill().await?;
            Ok(child.wait().await?.code())
        }
    }
}
