//! Command interpreter for interactive and scripted sessions

use crate::command::{Command, MAX_LINE_LEN};
use crate::copy;
use crate::error::FsError;
use crate::flash::Flash;
use crate::fs::FlashFs;
use anyhow::{Context, Result};
use log::debug;
use std::io::{self, BufRead, Read, Write};
use std::path::Path;

/// Interactive prompt
pub const PROMPT: &str = "> ";

/// Exit code for fatal errors
pub const EXIT_FATAL: u8 = 2;

/// Outcome of a session. Once failed it stays failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitStatus {
    #[default]
    Success,
    Failed,
}

impl ExitStatus {
    pub fn record_failure(&mut self) {
        *self = ExitStatus::Failed;
    }

    pub fn is_success(self) -> bool {
        self == ExitStatus::Success
    }

    /// Process exit code
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failed => 1,
        }
    }
}

/// Read one line into `buf`, keeping at most `limit` bytes. The rest of an
/// overlong line is discarded. Returns `None` at end of input, otherwise
/// whether the whole line fit.
fn read_bounded_line<R: BufRead>(
    input: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> io::Result<Option<bool>> {
    buf.clear();
    let n = input.by_ref().take(limit as u64).read_until(b'\n', buf)?;
    if n == 0 {
        return Ok(None);
    }
    if n < limit || buf.ends_with(b"\n") {
        return Ok(Some(true));
    }

    loop {
        let available = match input.fill_buf() {
            Ok(available) => available,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if available.is_empty() {
            // Input ended exactly at the limit, so the line is whole
            return Ok(Some(true));
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(idx) => {
                input.consume(idx + 1);
                // Only the terminator was left over
                return Ok(Some(idx == 0));
            }
            None => {
                let len = available.len();
                input.consume(len);
            }
        }
    }
}

/// True if the error chain carries a device fault
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain().any(|e| {
        if let Some(fs_err) = e.downcast_ref::<FsError>() {
            return fs_err.is_fatal();
        }
        e.downcast_ref::<io::Error>()
            .and_then(|io_err| io_err.get_ref())
            .and_then(|inner| inner.downcast_ref::<FsError>())
            .is_some_and(FsError::is_fatal)
    })
}

/// Runs commands against a mounted filesystem.
///
/// Command output (listings, `cat`, `info`) goes to `out`; diagnostics go
/// to `err`.
pub struct Interpreter<'a, F: Flash, O: Write, E: Write> {
    fs: &'a mut FlashFs<F>,
    out: O,
    err: E,
    status: ExitStatus,
}

impl<'a, F: Flash, O: Write, E: Write> Interpreter<'a, F, O, E> {
    pub fn new(fs: &'a mut FlashFs<F>, out: O, err: E) -> Self {
        Interpreter {
            fs,
            out,
            err,
            status: ExitStatus::Success,
        }
    }

    pub fn status(&self) -> ExitStatus {
        self.status
    }

    /// Consume the interpreter, returning its output streams
    pub fn into_streams(self) -> (O, E) {
        (self.out, self.err)
    }

    /// Execute lines until end of input. Errors returned from here are
    /// fatal; per-command failures only mark the status as failed.
    pub fn run<R: BufRead>(&mut self, mut input: R, interactive: bool) -> Result<ExitStatus> {
        let mut raw = Vec::new();

        if interactive {
            self.prompt()?;
        }
        // Room for the longest line plus a CRLF terminator
        let limit = MAX_LINE_LEN + 2;
        while let Some(complete) =
            read_bounded_line(&mut input, &mut raw, limit).context("Failed to read command input")?
        {
            let line = String::from_utf8_lossy(&raw);
            let command = if complete {
                Command::parse(&line)
            } else {
                Command::SyntaxError(line.trim())
            };
            // Blank lines and comments are skipped without a new prompt
            if command == Command::Blank {
                continue;
            }
            self.dispatch(command)?;

            if interactive {
                self.prompt()?;
            }
        }
        if interactive {
            writeln!(self.out)?;
            self.out.flush()?;
        }
        Ok(self.status)
    }

    fn prompt(&mut self) -> Result<()> {
        write!(self.out, "{}", PROMPT)?;
        self.out.flush()?;
        Ok(())
    }

    /// Parse and execute one line
    pub fn execute_line(&mut self, line: &str) -> Result<()> {
        self.dispatch(Command::parse(line))
    }

    fn dispatch(&mut self, command: Command<'_>) -> Result<()> {
        debug!("Command: {:?}", command);

        match self.execute(command) {
            Ok(()) => Ok(()),
            Err(e) if is_fatal(&e) => Err(e),
            Err(e) => {
                writeln!(self.err, "FAILED: {}: {:#}", command, e)?;
                self.status.record_failure();
                Ok(())
            }
        }
    }

    fn execute(&mut self, command: Command<'_>) -> Result<()> {
        match command {
            Command::Blank => Ok(()),
            Command::List => self.list(),
            Command::Import { src, dst } => copy::import(self.fs, Path::new(src), dst).map(|_| ()),
            Command::Export { src, dst } => copy::export(self.fs, src, Path::new(dst)).map(|_| ()),
            Command::Remove(path) => self
                .fs
                .remove(path)
                .with_context(|| format!("Failed to remove '{}'", path)),
            Command::Cat(path) => {
                copy::cat(self.fs, path, &mut self.out)?;
                self.out.flush()?;
                Ok(())
            }
            Command::Info => self.info(),
            Command::SyntaxError(line) => {
                writeln!(self.err, "SYNTAX ERROR: {}", line)?;
                self.status.record_failure();
                Ok(())
            }
        }
    }

    /// Print every entry of the root directory
    pub fn list(&mut self) -> Result<()> {
        let mut dir = self.fs.opendir("/").context("Failed to open directory")?;
        while let Some(entry) = self.fs.readdir(&mut dir) {
            writeln!(self.out, "{}", entry)?;
        }
        self.fs.closedir(dir);
        self.out.flush()?;
        Ok(())
    }

    fn info(&mut self) -> Result<()> {
        let info = self.fs.info().context("Failed to query usage")?;
        writeln!(self.out, "Total: {}, Used: {}", info.total, info.used)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::RamFlash;
    use crate::types::FsConfig;
    use std::path::PathBuf;

    const SIZE: u32 = 1024 * 1024;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("flashimg-shell-{}-{}", std::process::id(), name))
    }

    fn new_fs() -> FlashFs<RamFlash> {
        FlashFs::mount(RamFlash::erased(SIZE as usize), FsConfig::new(SIZE)).unwrap()
    }

    /// Run a script, returning (status, stdout, stderr)
    fn run_script(fs: &mut FlashFs<RamFlash>, script: &str) -> (ExitStatus, String, String) {
        let mut shell = Interpreter::new(fs, Vec::new(), Vec::new());
        let status = shell.run(script.as_bytes(), false).unwrap();
        let (out, err) = shell.into_streams();
        (
            status,
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
        )
    }

    fn used(output: &str) -> u64 {
        output
            .lines()
            .filter_map(|l| l.split("Used: ").nth(1))
            .last()
            .and_then(|n| n.trim().parse().ok())
            .unwrap()
    }

    #[test]
    fn test_fresh_image_info() {
        let mut fs = new_fs();
        let (status, out, err) = run_script(&mut fs, "info\n");
        assert!(status.is_success());
        assert!(err.is_empty());
        assert!(out.starts_with("Total: 1048576, Used: "));
        let used = used(&out);
        assert!(used > 0 && used < SIZE as u64);
    }

    #[test]
    fn test_import_ls_export_rm() {
        let host = temp_path("hello.txt");
        let out_file = temp_path("out.txt");
        std::fs::write(&host, "hi").unwrap();

        let mut fs = new_fs();
        let script = format!(
            "import {} /hello.txt\nexport /hello.txt {}\nls\n",
            host.display(),
            out_file.display()
        );
        let (status, out, err) = run_script(&mut fs, &script);
        assert!(status.is_success(), "stderr: {}", err);
        assert_eq!(std::fs::read(&out_file).unwrap(), b"hi");
        assert_eq!(out, "f      2 hello.txt\n");

        let (status, out, _) = run_script(&mut fs, "rm /hello.txt\nls\n");
        assert!(status.is_success());
        assert!(!out.contains("hello.txt"));

        std::fs::remove_file(&host).ok();
        std::fs::remove_file(&out_file).ok();
    }

    #[test]
    fn test_usage_tracks_import_and_remove() {
        let host = temp_path("usage.bin");
        std::fs::write(&host, vec![1u8; 1000]).unwrap();
        let mut fs = new_fs();

        let (_, before, _) = run_script(&mut fs, "info\n");
        let (_, after_import, _) =
            run_script(&mut fs, &format!("import {} /a.txt\ninfo\n", host.display()));
        let (_, after_rm, _) = run_script(&mut fs, "rm /a.txt\ninfo\n");

        assert!(used(&after_import) > used(&before));
        assert!(used(&after_import) <= SIZE as u64);
        assert!(used(&after_rm) <= used(&after_import));
        std::fs::remove_file(&host).ok();
    }

    #[test]
    fn test_syntax_error_keeps_going() {
        let mut fs = new_fs();
        let (status, out, err) = run_script(&mut fs, "frobnicate\ninfo\n");
        assert_eq!(status, ExitStatus::Failed);
        assert_eq!(err, "SYNTAX ERROR: frobnicate\n");
        assert!(out.starts_with("Total: "));
    }

    #[test]
    fn test_missing_import_source_is_recoverable() {
        let host = temp_path("present.txt");
        std::fs::write(&host, "data").unwrap();
        let missing = temp_path("missing.txt");

        let mut fs = new_fs();
        let script = format!(
            "import {} /x\nimport {} /y\nls\n",
            missing.display(),
            host.display()
        );
        let (status, out, err) = run_script(&mut fs, &script);
        assert_eq!(status.code(), 1);
        assert!(err.starts_with("FAILED: import "));
        assert_eq!(out, "f      4 y\n");
        std::fs::remove_file(&host).ok();
    }

    #[test]
    fn test_failed_rm_and_cat() {
        let mut fs = new_fs();
        let (status, out, err) = run_script(&mut fs, "rm /nope\ncat /nope\n");
        assert_eq!(status, ExitStatus::Failed);
        assert!(out.is_empty());
        assert_eq!(err.lines().count(), 2);
        assert!(err.lines().all(|l| l.starts_with("FAILED: ")));
    }

    #[test]
    fn test_cat_writes_to_output() {
        let host = temp_path("cat.txt");
        std::fs::write(&host, "some text\n").unwrap();
        let mut fs = new_fs();

        let script = format!("# copy it in\n\nimport {} /c\ncat /c\n", host.display());
        let (status, out, _) = run_script(&mut fs, &script);
        assert!(status.is_success());
        assert_eq!(out, "some text\n");
        std::fs::remove_file(&host).ok();
    }

    #[test]
    fn test_interactive_prompts() {
        let mut fs = new_fs();
        let mut shell = Interpreter::new(&mut fs, Vec::new(), Vec::new());
        let status = shell.run("ls\n\n".as_bytes(), true).unwrap();
        assert!(status.is_success());

        let (out, _) = shell.into_streams();
        assert_eq!(String::from_utf8(out).unwrap(), "> > \n");
    }

    #[test]
    fn test_no_prompt_after_blank_or_comment() {
        let mut fs = new_fs();
        let mut shell = Interpreter::new(&mut fs, Vec::new(), Vec::new());
        shell.run("\n# c\n   \nls\n".as_bytes(), true).unwrap();

        let (out, _) = shell.into_streams();
        assert_eq!(String::from_utf8(out).unwrap(), "> > \n");
    }

    #[test]
    fn test_overlong_line_is_discarded() {
        let mut fs = new_fs();
        let script = format!("cat /{}\ninfo\n", "x".repeat(10_000));
        let (status, out, err) = run_script(&mut fs, &script);

        assert_eq!(status, ExitStatus::Failed);
        // Only the bounded prefix is echoed, and the next line still runs
        let first = err.lines().next().unwrap();
        assert!(first.starts_with("SYNTAX ERROR: cat /xxx"));
        assert!(first.len() <= "SYNTAX ERROR: ".len() + MAX_LINE_LEN + 2);
        assert_eq!(err.lines().count(), 1);
        assert!(out.starts_with("Total: "));
    }

    #[test]
    fn test_read_bounded_line() {
        let mut input = "short\nabcdefghij\nnext".as_bytes();
        let mut buf = Vec::new();

        assert_eq!(read_bounded_line(&mut input, &mut buf, 8).unwrap(), Some(true));
        assert_eq!(buf, b"short\n");
        assert_eq!(read_bounded_line(&mut input, &mut buf, 8).unwrap(), Some(false));
        assert_eq!(buf, b"abcdefgh");
        assert_eq!(read_bounded_line(&mut input, &mut buf, 8).unwrap(), Some(true));
        assert_eq!(buf, b"next");
        assert_eq!(read_bounded_line(&mut input, &mut buf, 8).unwrap(), None);
    }

    #[test]
    fn test_status_is_sticky() {
        let mut status = ExitStatus::default();
        assert_eq!(status.code(), 0);
        status.record_failure();
        status.record_failure();
        assert_eq!(status.code(), 1);
        assert!(!status.is_success());
    }

    #[test]
    fn test_fatal_classification() {
        let device = anyhow::Error::new(FsError::OutOfBounds {
            addr: 0,
            len: 1,
            size: 0,
        })
        .context("Failed to write '/x'");
        assert!(is_fatal(&device));

        let wrapped = anyhow::Error::new(io::Error::other(FsError::OutOfBounds {
            addr: 0,
            len: 1,
            size: 0,
        }));
        assert!(is_fatal(&wrapped));

        let full = anyhow::Error::new(io::Error::other(FsError::Full));
        assert!(!is_fatal(&full));
    }
}
