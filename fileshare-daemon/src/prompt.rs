//! User interaction: consent, directory and file pickers, peer selection.
//!
//! Prompt methods block. Async callers go through [`run_blocking`].

use std::io::{BufRead, BufReader, Stdout, Write};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

pub const SAVE_DIRECTORY_TITLE: &str = "Choose where to save";

pub trait UserPrompt: Send + Sync {
    /// Yes/no question. Anything but an explicit yes is a no.
    fn confirm(&self, title: &str, message: &str) -> bool;
    /// Existing directory to save into; `None` when cancelled.
    fn pick_save_directory(&self, title: &str) -> Option<PathBuf>;
    /// Existing file to send; `None` when cancelled.
    fn pick_open_file(&self, title: &str) -> Option<PathBuf>;
    /// One of `items`; `None` when cancelled.
    fn choose_from_list(&self, title: &str, items: &[String]) -> Option<String>;

    /// Confirm, then pick a save directory. Implementations that can stop waiting
    /// give up at `deadline` and answer `None`.
    fn consent(&self, title: &str, message: &str, deadline: Instant) -> Option<PathBuf> {
        let _ = deadline;
        if !self.confirm(title, message) {
            return None;
        }
        self.pick_save_directory(SAVE_DIRECTORY_TITLE)
    }
}

/// Run prompt calls on the blocking pool.
pub async fn run_blocking<T, F>(prompt: Arc<dyn UserPrompt>, f: F) -> Result<T, tokio::task::JoinError>
where
    F: FnOnce(&dyn UserPrompt) -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || f(prompt.as_ref())).await
}

/// Line-oriented prompt. A background thread reads lines into a channel, so a
/// question can stop waiting without leaving a read behind that would swallow the
/// next answer. Interactions are serialized; a consent question holds the lock
/// through both of its steps.
pub struct LinePrompt<W> {
    io: Mutex<(Receiver<String>, W)>,
}

pub type ConsolePrompt = LinePrompt<Stdout>;

impl ConsolePrompt {
    pub fn stdio() -> Self {
        LinePrompt::new(BufReader::new(std::io::stdin()), std::io::stdout())
    }
}

impl<W: Write> LinePrompt<W> {
    pub fn new<R>(reader: R, writer: W) -> Self
    where
        R: BufRead + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            for line in reader.lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
            debug!("prompt input closed");
        });
        Self {
            io: Mutex::new((rx, writer)),
        }
    }

    /// Print `question` and wait for one trimmed line. `None` on EOF, I/O error,
    /// or when `deadline` passes first.
    fn ask(io: &mut (Receiver<String>, W), question: &str, deadline: Option<Instant>) -> Option<String> {
        let (lines, writer) = io;
        write!(writer, "{question}").ok()?;
        writer.flush().ok()?;
        let line = match deadline {
            None => lines.recv().ok()?,
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match lines.recv_timeout(wait) {
                    Ok(line) => line,
                    Err(RecvTimeoutError::Timeout) => {
                        let _ = writeln!(writer, "\n(no answer, declined)");
                        return None;
                    }
                    Err(RecvTimeoutError::Disconnected) => return None,
                }
            }
        };
        Some(line.trim().to_string())
    }

    fn ask_path(
        io: &mut (Receiver<String>, W),
        title: &str,
        want_dir: bool,
        deadline: Option<Instant>,
    ) -> Option<PathBuf> {
        let answer = Self::ask(io, &format!("{title} (empty to cancel): "), deadline)?;
        if answer.is_empty() {
            return None;
        }
        let path = PathBuf::from(answer);
        let ok = if want_dir { path.is_dir() } else { path.is_file() };
        if !ok {
            let kind = if want_dir { "directory" } else { "file" };
            let _ = writeln!(io.1, "{} is not a {kind}", path.display());
            return None;
        }
        Some(path)
    }

    fn ask_confirm(
        io: &mut (Receiver<String>, W),
        title: &str,
        message: &str,
        deadline: Option<Instant>,
    ) -> bool {
        let answer = Self::ask(io, &format!("[{title}] {message} [y/N] "), deadline);
        matches!(
            answer.as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("y") | Some("yes")
        )
    }
}

impl<W> UserPrompt for LinePrompt<W>
where
    W: Write + Send,
{
    fn confirm(&self, title: &str, message: &str) -> bool {
        Self::ask_confirm(&mut self.io.lock(), title, message, None)
    }

    fn pick_save_directory(&self, title: &str) -> Option<PathBuf> {
        Self::ask_path(&mut self.io.lock(), title, true, None)
    }

    fn pick_open_file(&self, title: &str) -> Option<PathBuf> {
        Self::ask_path(&mut self.io.lock(), title, false, None)
    }

    fn choose_from_list(&self, title: &str, items: &[String]) -> Option<String> {
        let mut io = self.io.lock();
        let _ = writeln!(io.1, "{title}");
        for (i, item) in items.iter().enumerate() {
            let _ = writeln!(io.1, "  {}) {item}", i + 1);
        }
        let answer = Self::ask(&mut io, "choice (empty to cancel): ", None)?;
        if let Ok(n) = answer.parse::<usize>() {
            return n.checked_sub(1).and_then(|i| items.get(i)).cloned();
        }
        items.iter().find(|item| **item == answer).cloned()
    }

    fn consent(&self, title: &str, message: &str, deadline: Instant) -> Option<PathBuf> {
        let mut io = self.io.try_lock_until(deadline)?;
        if !Self::ask_confirm(&mut io, title, message, Some(deadline)) {
            return None;
        }
        Self::ask_path(&mut io, SAVE_DIRECTORY_TITLE, true, Some(deadline))
    }
}

/// Accepts every inbound file into a fixed directory. Cannot drive a send.
#[derive(Debug, Clone)]
pub struct AutoAccept {
    dir: PathBuf,
}

impl AutoAccept {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl UserPrompt for AutoAccept {
    fn confirm(&self, _title: &str, _message: &str) -> bool {
        true
    }

    fn pick_save_directory(&self, _title: &str) -> Option<PathBuf> {
        Some(self.dir.clone())
    }

    fn pick_open_file(&self, _title: &str) -> Option<PathBuf> {
        None
    }

    fn choose_from_list(&self, _title: &str, _items: &[String]) -> Option<String> {
        None
    }
}

#[cfg(test)]
pub(crate) mod test_io {
    use super::*;
    use std::io::{Cursor, Read};
    use std::sync::mpsc::Sender;

    /// Input that arrives only when the test types it.
    pub(crate) struct Keyboard {
        keys: Receiver<Vec<u8>>,
        pending: Cursor<Vec<u8>>,
    }

    impl Read for Keyboard {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pending.position() as usize == self.pending.get_ref().len() {
                match self.keys.recv() {
                    Ok(bytes) => self.pending = Cursor::new(bytes),
                    Err(_) => return Ok(0),
                }
            }
            self.pending.read(buf)
        }
    }

    pub(crate) fn keyboard() -> (Sender<Vec<u8>>, BufReader<Keyboard>) {
        let (tx, keys) = mpsc::channel();
        let reader = Keyboard {
            keys,
            pending: Cursor::new(Vec::new()),
        };
        (tx, BufReader::new(reader))
    }

    /// Writer whose output the test can read while the prompt still owns it.
    #[derive(Clone, Default)]
    pub(crate) struct Screen(Arc<Mutex<Vec<u8>>>);

    impl Screen {
        pub(crate) fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl Write for Screen {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
