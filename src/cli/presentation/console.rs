//! Console renderer: prints every unit's tokens as they stream.
//!
//! Units of a phased stage stream concurrently, so output interleaves; a header is
//! printed whenever the unit being printed changes.

use crate::stream::{StreamEvent, StreamHub, Terminal};
use owo_colors::OwoColorize;
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Formats stream events onto a writer.
pub struct ConsolePrinter<W: Write> {
    out: W,
    color: bool,
    current: Option<(String, u32)>,
}

impl<W: Write> ConsolePrinter<W> {
    pub fn new(out: W, color: bool) -> Self {
        Self {
            out,
            color,
            current: None,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn paint(&self, text: String, style: fn(&str) -> String) -> String {
        if self.color {
            style(&text)
        } else {
            text
        }
    }

    pub fn print(&mut self, event: &StreamEvent) -> std::io::Result<()> {
        let same_unit = matches!(&self.current, Some((unit, _)) if *unit == event.unit_id);
        if !same_unit {
            let header = self.paint(format!("\n== {} ==", event.unit_id), |s| {
                s.bold().cyan().to_string()
            });
            writeln!(self.out, "{}", header)?;
        } else if matches!(&self.current, Some((_, attempt)) if *attempt != event.attempt) {
            let notice = self.paint(format!("\n[attempt {}]", event.attempt), |s| {
                s.yellow().to_string()
            });
            writeln!(self.out, "{}", notice)?;
        }
        self.current = Some((event.unit_id.clone(), event.attempt));

        write!(self.out, "{}", event.delta)?;
        match &event.terminal {
            None => {}
            Some(Terminal::Ok) => writeln!(self.out)?,
            Some(Terminal::Error(message)) => {
                let line = self.paint(format!("\n✗ {}", message), |s| s.red().to_string());
                writeln!(self.out, "{}", line)?;
            }
            Some(Terminal::Cancelled) => {
                let line = self.paint("\n[cancelled]".to_string(), |s| s.yellow().to_string());
                writeln!(self.out, "{}", line)?;
            }
            Some(Terminal::Overflow) => {
                let line = self.paint("\n[output dropped: console fell behind]".to_string(), |s| {
                    s.dimmed().to_string()
                });
                writeln!(self.out, "{}", line)?;
            }
        }
        self.out.flush()
    }
}

/// Background task printing every unit opened on a hub after it was spawned.
pub struct ConsoleRenderer {
    task: JoinHandle<()>,
}

impl ConsoleRenderer {
    pub fn spawn(hub: &StreamHub, color: bool) -> Self {
        let mut tap = hub.tap();
        let (tx, mut rx) = mpsc::unbounded_channel::<StreamEvent>();
        tokio::spawn(async move {
            while let Some(mut subscription) = tap.recv().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = subscription.next().await {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                });
            }
        });
        let task = tokio::spawn(async move {
            let mut printer = ConsolePrinter::new(std::io::stdout(), color);
            while let Some(event) = rx.recv().await {
                if let Err(err) = printer.print(&event) {
                    debug!(error = %err, "Console output failed, renderer stopping");
                    break;
                }
            }
        });
        Self { task }
    }

    /// Wait for buffered output to drain once the hub is gone, then stop.
    pub async fn finish(mut self, grace: Duration) {
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            self.task.abort();
        }
    }
}
