//! Line-oriented rendering of both sessions.
//!
//! Output contract:
//! - model text → stdout, each line prefixed with `[N] `
//! - notices, errors, retry status and countdowns → stderr, bracketed

use std::io::{IsTerminal, Stderr, Stdout, Write, stderr, stdout};

use duet_core::core::autoreply::format_countdown;
use duet_core::core::{Message, Phase, Role, SessionId, SessionView};

pub struct ConsoleUi<O: Write = Stdout, E: Write = Stderr> {
    out: O,
    err: E,
    /// Session whose streamed line is still open on `out`.
    open_line: Option<SessionId>,
    /// Sessions whose current response has been streamed to `out`.
    streamed: [bool; 2],
    /// Whether countdown ticks are redrawn in place on `err`.
    live_countdown: bool,
    countdown_shown: bool,
}

impl Default for ConsoleUi {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleUi {
    pub fn new() -> Self {
        let live_countdown = stderr().is_terminal();
        let mut ui = Self::with_writers(stdout(), stderr());
        ui.live_countdown = live_countdown;
        ui
    }
}

impl<O: Write, E: Write> ConsoleUi<O, E> {
    pub fn with_writers(out: O, err: E) -> Self {
        Self {
            out,
            err,
            open_line: None,
            streamed: [false; 2],
            live_countdown: false,
            countdown_shown: false,
        }
    }

    /// Terminates any open line.
    pub fn finish(&mut self) {
        self.close_line();
        self.clear_countdown();
    }

    fn close_line(&mut self) {
        if self.open_line.take().is_some() {
            let _ = writeln!(self.out);
            let _ = self.out.flush();
        }
    }

    fn clear_countdown(&mut self) {
        if self.countdown_shown {
            let _ = write!(self.err, "\r\x1b[2K");
            let _ = self.err.flush();
            self.countdown_shown = false;
        }
    }

    fn diagnostic(&mut self, session: SessionId, text: &str) {
        self.close_line();
        self.clear_countdown();
        let _ = writeln!(self.err, "[{session}] [{text}]");
    }

    fn write_prefixed(&mut self, session: SessionId, text: &str) {
        let mut lines = text.split('\n');
        if let Some(first) = lines.next() {
            let _ = write!(self.out, "{first}");
        }
        for line in lines {
            let _ = write!(self.out, "\n[{session}] {line}");
        }
        let _ = self.out.flush();
    }

    #[cfg(test)]
    fn output(&self) -> (&O, &E) {
        (&self.out, &self.err)
    }
}

impl<O: Write, E: Write> SessionView for ConsoleUi<O, E> {
    fn phase_changed(&mut self, session: SessionId, phase: Phase) {
        if phase == Phase::Idle && self.open_line == Some(session) {
            self.close_line();
        }
    }

    fn stream_started(&mut self, session: SessionId) {
        self.close_line();
        self.clear_countdown();
        let _ = write!(self.out, "[{session}] ");
        self.open_line = Some(session);
        self.streamed[session.index()] = true;
    }

    fn stream_chunk(&mut self, session: SessionId, text: &str) {
        if self.open_line != Some(session) {
            self.stream_started(session);
        }
        self.write_prefixed(session, text);
    }

    fn message_appended(&mut self, session: SessionId, message: &Message) {
        if message.ui_only {
            self.diagnostic(session, &message.text);
            return;
        }
        if message.role == Role::User {
            return;
        }
        // Already on screen when it was streamed
        if std::mem::take(&mut self.streamed[session.index()]) {
            if self.open_line == Some(session) {
                self.close_line();
            }
            return;
        }
        self.stream_started(session);
        self.write_prefixed(session, &message.text);
        self.streamed[session.index()] = false;
        self.close_line();
    }

    fn status(&mut self, session: SessionId, text: Option<&str>) {
        if let Some(text) = text {
            self.diagnostic(session, text);
        }
    }

    fn countdown(&mut self, session: SessionId, remaining_secs: Option<u64>) {
        match remaining_secs {
            Some(secs) if self.live_countdown && self.open_line.is_none() => {
                let _ = write!(
                    self.err,
                    "\r\x1b[2K[{session}] auto-reply in {}",
                    format_countdown(secs)
                );
                let _ = self.err.flush();
                self.countdown_shown = true;
            }
            Some(_) => {}
            None => self.clear_countdown(),
        }
    }
}
