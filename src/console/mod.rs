//! Operator console plumbing.
//!
//! Commands are produced by a blocking stdin reader thread (or by the HTTP
//! layer at shutdown) and consumed by the match tick loop, which drains the
//! queue once per tick. The queue exists purely to keep blocking console
//! input off the tick thread.

use tokio::sync::mpsc;
use tracing::debug;

/// One operator-issued command.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub content: String,
}

impl Command {
    /// Split a console line into command name and argument text.
    pub fn parse(line: &str) -> Option<Command> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (name, content) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        Some(Command {
            name: name.to_string(),
            content: content.to_string(),
        })
    }
}

/// Producer half, cloneable across threads.
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl CommandSender {
    pub fn submit(&self, command: Command) {
        let _ = self.tx.send(command);
    }

    pub fn submit_line(&self, line: &str) {
        if let Some(command) = Command::parse(line) {
            self.submit(command);
        }
    }
}

/// Consumer half, owned by the match server.
pub struct CommandQueue {
    rx: mpsc::UnboundedReceiver<Command>,
}

impl CommandQueue {
    pub fn read_next(&mut self) -> Option<Command> {
        self.rx.try_recv().ok()
    }
}

pub fn command_queue() -> (CommandSender, CommandQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandSender { tx }, CommandQueue { rx })
}

/// Spawn the blocking stdin reader feeding the given sender.
pub fn spawn_stdin_reader(sender: CommandSender) {
    std::thread::Builder::new()
        .name("console-stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            let mut line = String::new();
            loop {
                line.clear();
                match stdin.read_line(&mut line) {
                    Ok(0) => {
                        debug!("Stdin closed, console reader exiting");
                        break;
                    }
                    Ok(_) => sender.submit_line(&line),
                    Err(e) => {
                        debug!(error = %e, "Stdin read failed, console reader exiting");
                        break;
                    }
                }
            }
        })
        .expect("failed to spawn console reader thread");
}
